//! `opsflow` Core Library
//!
//! Shared functionality for `opsflow` components:
//! - Configuration resolution and hierarchy
//! - SQLite connection helpers
//! - Text utilities (ANSI stripping, secret redaction, base64)
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod text;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
