//! Execution log database.

pub use opsflow_core::db::DatabaseError;

opsflow_core::define_database!(Database, "Execution log migrations complete");
