//! Workflow definitions as loaded from the catalog.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const fn enabled_by_default() -> bool {
    true
}

/// A named sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    /// Names of every credential referenced by any target, deduplicated.
    pub fn credential_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .steps
            .iter()
            .flat_map(|s| s.targets.iter())
            .filter_map(|t| t.credential.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// One script execution unit, fanned out to its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Abort every later step when this one ends Faulty.
    #[serde(default)]
    pub abort_on_error: bool,
    pub script: Script,
    #[serde(default, rename = "target")]
    pub targets: Vec<Target>,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<StepParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub body: String,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ScriptParameter>,
}

/// Declared script parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    /// Any JSON value, passed to the script as its serialized text.
    Json,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Value supplied by a step for one script parameter.
///
/// A `runtime` parameter has no stored value; the caller must supply it
/// when the workflow is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParameter {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub runtime: bool,
}

/// A destination host for a step. No `host` means the local machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub credential: Option<String>,
}

impl Target {
    pub fn is_local(&self) -> bool {
        self.host
            .as_deref()
            .is_none_or(|h| h.is_empty() || h == "localhost" || h == "127.0.0.1")
    }
}

/// Resolved credential material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("secret", &opsflow_core::text::SECRET_MASK)
            .finish()
    }
}

/// Credentials resolved for one run, keyed by name.
pub type CredentialCache = HashMap<String, Credential>;
