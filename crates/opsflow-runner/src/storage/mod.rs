//! Storage collaborators for the orchestrator.
//!
//! [`WorkflowStore`] and [`CredentialStore`] are the seams the orchestrator
//! depends on. [`LocalStore`] backs them with a TOML workflow catalog and a
//! `SQLite` execution log database.

mod catalog;
mod credentials;
mod db;
mod models;
mod queries;

use std::path::PathBuf;

use async_trait::async_trait;

pub use catalog::WorkflowCatalog;
pub use credentials::FileCredentialStore;
pub use db::{Database, DatabaseError};
pub use models::*;

use crate::orchestration::ExecutionLog;
use crate::workflow::{Credential, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid definition in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid workflow id '{0}'")]
    InvalidId(String),
}

/// Workflow definitions in, execution logs out.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// `Ok(None)` when the workflow does not exist.
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn save_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when no credential has this name.
    async fn resolve(&self, name: &str) -> Result<Option<Credential>, StoreError>;
}

/// Catalog directory plus execution log database.
#[derive(Clone)]
pub struct LocalStore {
    catalog: WorkflowCatalog,
    db: Database,
}

impl LocalStore {
    pub const fn new(catalog: WorkflowCatalog, db: Database) -> Self {
        Self { catalog, db }
    }

    pub const fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl WorkflowStore for LocalStore {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        self.catalog.load(id).await
    }

    async fn save_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        Ok(self.db.save_execution_log(log).await?)
    }
}
