//! Interpreter process handles.
//!
//! - [`ProcessHandle`]: pooled resource wrapping one interpreter process.
//! - [`OutputBuffer`]: fragment-aware reassembly of streamed stdout.
//! - [`BulkDelimiter`]: end-of-invocation sentinel detection.
//! - [`ScriptDialect`]: command protocol per interpreter.

pub mod delimiter;
pub mod dialect;
pub mod handle;
pub mod output;

pub use delimiter::{BulkDelimiter, DelimiterError, DEFAULT_DELIMITER_PATTERN};
pub use dialect::{ArgValue, Argument, DialectError, RemoteTarget, ScriptDialect};
pub use handle::{
    InvocationEvent, InvocationOutput, InvocationStatus, InvokeError, ProcessHandle,
    RECEIVING_DATA,
};
pub use output::{OutputBuffer, Utf8Decoder};
