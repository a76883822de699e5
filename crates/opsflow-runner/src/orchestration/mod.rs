//! Workflow execution: sequencing, fan-out, result aggregation and
//! cancellation.
//!
//! - [`Orchestrator`]: runs a workflow against pooled process handles.
//! - [`ExecutionControl`]: soft cancel and hard kill for one run.
//! - [`ExecutionLog`] and friends: per-run, per-step, per-target records.

pub mod control;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod records;

pub use control::{ControlState, ExecutionControl};
pub use error::ExecutionError;
pub use events::{EventStatus, ExecutionEvent, ExecutionStats};
pub use orchestrator::{ExecutionResult, Orchestrator};
pub use records::{ExecutionLog, ExecutionStatus, ExecutionStep, ExecutionTarget, summarize};
