//! Execution result records for one workflow run.

use std::fmt;
use std::str::FromStr;

use opsflow_core::db::unix_timestamp_millis;
use serde::{Deserialize, Serialize};

use crate::workflow::{Target, WorkflowStep};

/// Outcome of a run, step or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Not started yet.
    Pending,
    /// In progress.
    Running,
    /// Finished without error.
    Success,
    /// Finished with an error.
    Faulty,
    /// Disabled, or nothing to run.
    Skipped,
    /// Not run because an earlier step failed with abort-on-error.
    Aborted,
    /// Stopped or never started because the user cancelled the run.
    CancelledByUser,
}

impl ExecutionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Faulty => "faulty",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
            Self::CancelledByUser => "cancelled_by_user",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "faulty" => Ok(Self::Faulty),
            "skipped" => Ok(Self::Skipped),
            "aborted" => Ok(Self::Aborted),
            "cancelled_by_user" => Ok(Self::CancelledByUser),
            other => Err(format!("Unknown execution status: {other}")),
        }
    }
}

/// Fold child statuses into one.
///
/// Precedence is CancelledByUser > Aborted > Faulty > Success. When every
/// child was skipped (or there are none) the result is Skipped.
pub fn summarize<I>(statuses: I) -> ExecutionStatus
where
    I: IntoIterator<Item = ExecutionStatus>,
{
    let mut cancelled = false;
    let mut aborted = false;
    let mut faulty = false;
    let mut all_skipped = true;

    for status in statuses {
        match status {
            ExecutionStatus::CancelledByUser => cancelled = true,
            ExecutionStatus::Aborted => aborted = true,
            ExecutionStatus::Faulty => faulty = true,
            ExecutionStatus::Skipped => continue,
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Success => {}
        }
        all_skipped = false;
    }

    if cancelled {
        ExecutionStatus::CancelledByUser
    } else if aborted {
        ExecutionStatus::Aborted
    } else if faulty {
        ExecutionStatus::Faulty
    } else if all_skipped {
        ExecutionStatus::Skipped
    } else {
        ExecutionStatus::Success
    }
}

/// Result of running one step's script on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    pub target_id: String,
    pub name: String,
    pub host: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl ExecutionTarget {
    pub fn pending(target: &Target) -> Self {
        Self {
            target_id: target.id.clone(),
            name: target.name.clone(),
            host: target.host.clone(),
            status: ExecutionStatus::Pending,
            output: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(unix_timestamp_millis());
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(unix_timestamp_millis());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: String,
    pub name: String,
    pub index: usize,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub targets: Vec<ExecutionTarget>,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl ExecutionStep {
    pub fn pending(index: usize, step: &WorkflowStep) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            index,
            status: ExecutionStatus::Pending,
            targets: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// A step that was never dispatched. It carries no target records.
    pub fn not_run(index: usize, step: &WorkflowStep, status: ExecutionStatus) -> Self {
        Self {
            status,
            ..Self::pending(index, step)
        }
    }
}

/// The full record of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    pub error: Option<String>,
}

impl ExecutionLog {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_name: String::new(),
            status: ExecutionStatus::Running,
            started_at: unix_timestamp_millis(),
            finished_at: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn step_statuses(&self) -> impl Iterator<Item = ExecutionStatus> + '_ {
        self.steps.iter().map(|s| s.status)
    }
}
