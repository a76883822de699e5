//! Runtime parameter merging and script argument validation.

use std::collections::HashMap;

use serde_json::Value;

use super::model::{ParameterType, ScriptParameter, Workflow, WorkflowStep};
use crate::process::{ArgValue, Argument};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("Missing runtime parameter '{parameter}' for step '{step}'")]
    MissingRuntimeParameter { step: String, parameter: String },

    #[error("Wrong parameter data for '{parameter}': {reason}")]
    WrongParameterData { parameter: String, reason: String },

    #[error("Invalid runtime parameter assignment '{0}', expected step.name=value")]
    InvalidAssignment(String),
}

fn wrong(parameter: &str, reason: impl Into<String>) -> ParameterError {
    ParameterError::WrongParameterData {
        parameter: parameter.to_string(),
        reason: reason.into(),
    }
}

/// Values supplied by the caller for runtime parameters, keyed by step id
/// and parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeParameters {
    values: HashMap<String, HashMap<String, Value>>,
}

impl RuntimeParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, step_id: impl Into<String>, name: impl Into<String>, value: Value) {
        self.values
            .entry(step_id.into())
            .or_default()
            .insert(name.into(), value);
    }

    pub fn get(&self, step_id: &str, name: &str) -> Option<&Value> {
        self.values.get(step_id)?.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(HashMap::is_empty)
    }

    /// Parse a `step.name=value` assignment. The value is kept as text and
    /// coerced to the declared type at validation time.
    pub fn parse_assignment(&mut self, assignment: &str) -> Result<(), ParameterError> {
        let invalid = || ParameterError::InvalidAssignment(assignment.to_string());
        let (key, value) = assignment.split_once('=').ok_or_else(invalid)?;
        let (step, name) = key.split_once('.').ok_or_else(invalid)?;
        if step.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        self.set(step, name, Value::String(value.to_string()));
        Ok(())
    }
}

/// Fill every runtime parameter of `workflow` from `runtime`.
///
/// Any runtime parameter without a supplied value fails the whole run.
pub fn apply_runtime_parameters(
    workflow: &mut Workflow,
    runtime: &RuntimeParameters,
) -> Result<(), ParameterError> {
    for step in &mut workflow.steps {
        for param in step.parameters.iter_mut().filter(|p| p.runtime) {
            let value = runtime.get(&step.id, &param.name).ok_or_else(|| {
                ParameterError::MissingRuntimeParameter {
                    step: step.name.clone(),
                    parameter: param.name.clone(),
                }
            })?;
            param.value = value.clone();
        }
    }
    Ok(())
}

/// Build the validated argument list for one step.
///
/// Optional parameters the step does not supply are left out so the script's
/// own defaults apply.
pub fn build_arguments(step: &WorkflowStep) -> Result<Vec<Argument>, ParameterError> {
    if let Some(unknown) = step
        .parameters
        .iter()
        .find(|p| !step.script.parameters.iter().any(|d| d.name == p.name))
    {
        return Err(wrong(&unknown.name, "not declared by the script"));
    }

    let mut args = Vec::with_capacity(step.script.parameters.len());
    for declared in &step.script.parameters {
        match step.parameters.iter().find(|p| p.name == declared.name) {
            Some(supplied) => {
                let value = coerce(declared, &supplied.value)?;
                args.push(Argument::new(declared.name.clone(), value));
            }
            None if declared.required => {
                return Err(wrong(&declared.name, "required parameter has no value"));
            }
            None => {}
        }
    }
    Ok(args)
}

fn coerce(declared: &ScriptParameter, value: &Value) -> Result<ArgValue, ParameterError> {
    let name = declared.name.as_str();
    let mismatch = || wrong(name, format!("expected {}, got {value}", declared.kind));

    if value.is_null() {
        return if declared.nullable {
            Ok(ArgValue::Null)
        } else {
            Err(wrong(name, "null is not allowed"))
        };
    }

    match declared.kind {
        ParameterType::String => value
            .as_str()
            .map(|s| ArgValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        ParameterType::Integer => match value {
            Value::Number(n) => n.as_i64().map(ArgValue::Integer).ok_or_else(mismatch),
            Value::String(s) => s.trim().parse().map(ArgValue::Integer).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ParameterType::Number => match value {
            Value::Number(n) => n.as_f64().map(ArgValue::Number).ok_or_else(mismatch),
            Value::String(s) => s.trim().parse().map(ArgValue::Number).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ParameterType::Boolean => match value {
            Value::Bool(b) => Ok(ArgValue::Boolean(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ArgValue::Boolean(true)),
                "false" | "0" | "no" => Ok(ArgValue::Boolean(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        ParameterType::Json => Ok(ArgValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    }
}
