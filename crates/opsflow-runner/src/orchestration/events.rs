//! Progress events published while a workflow runs.

use serde::Serialize;

use super::records::ExecutionStatus;
use crate::process::InvocationStatus;

/// Capacity of the orchestrator's event broadcast channel.
pub const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Snapshot of run progress attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub workflow_name: String,
    pub current_step: Option<usize>,
    pub step_statuses: Vec<ExecutionStatus>,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventStatus {
    /// Run or step level.
    Execution(ExecutionStatus),
    /// Forwarded from a target's process handle.
    Invocation(InvocationStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub status: EventStatus,
    pub message: String,
    pub timestamp: i64,
    /// Name of the target that produced the message, if any.
    pub source: Option<String>,
    pub context: ExecutionStats,
}
