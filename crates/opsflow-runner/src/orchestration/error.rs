//! Run-level orchestration errors.

use crate::workflow::ParameterError;

/// Errors that end a whole run, or that the caller must see in the result.
///
/// Failures local to one step or target are recorded in the execution log
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Missing runtime parameter '{parameter}' for step '{step}'")]
    MissingRuntimeParameter { step: String, parameter: String },

    #[error("Wrong parameter data for '{parameter}': {reason}")]
    WrongParameterData { parameter: String, reason: String },

    #[error("Failed to resolve credential '{name}': {reason}")]
    Credential { name: String, reason: String },

    #[error("Failed to save execution log: {0}")]
    SaveLogFailed(String),

    #[error("Storage error: {0}")]
    Store(String),
}

impl From<ParameterError> for ExecutionError {
    fn from(e: ParameterError) -> Self {
        match e {
            ParameterError::MissingRuntimeParameter { step, parameter } => {
                Self::MissingRuntimeParameter { step, parameter }
            }
            ParameterError::WrongParameterData { parameter, reason } => {
                Self::WrongParameterData { parameter, reason }
            }
            ParameterError::InvalidAssignment(text) => Self::WrongParameterData {
                parameter: text,
                reason: "expected step.name=value".to_string(),
            },
        }
    }
}
