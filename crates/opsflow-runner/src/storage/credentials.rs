//! Credentials read from a TOML file of `[[credential]]` entries.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{CredentialStore, StoreError};
use crate::workflow::Credential;

#[derive(Deserialize)]
struct CredentialFile {
    #[serde(default, rename = "credential")]
    credentials: Vec<Credential>,
}

/// In-memory credential lookup, optionally loaded from disk.
#[derive(Debug, Clone, Default)]
pub struct FileCredentialStore {
    credentials: HashMap<String, Credential>,
}

impl FileCredentialStore {
    pub fn new<I: IntoIterator<Item = Credential>>(credentials: I) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file: CredentialFile = toml::from_str(&content).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!(path = %path.display(), count = file.credentials.len(), "Credentials loaded");
        Ok(Self::new(file.credentials))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn resolve(&self, name: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.credentials.get(name).cloned())
    }
}
