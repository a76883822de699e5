//! opsflow runner library
//!
//! Runs multi-step workflows against pooled interpreter processes:
//! - Generic bounded resource pool with a FIFO wait queue
//! - Process handles that stream and reassemble interpreter output
//! - Workflow orchestration with soft cancel and hard kill
//! - Workflow catalog, credentials and `SQLite` execution logs

pub mod orchestration;
pub mod pool;
pub mod process;
pub mod storage;
pub mod workflow;
