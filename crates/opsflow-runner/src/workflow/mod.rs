//! Workflow definitions and parameter handling.

pub mod model;
pub mod params;

pub use model::{
    Credential, CredentialCache, ParameterType, Script, ScriptParameter, StepParameter, Target,
    Workflow, WorkflowStep,
};
pub use params::{apply_runtime_parameters, build_arguments, ParameterError, RuntimeParameters};
