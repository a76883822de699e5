//! Workflow definitions stored as `<id>.toml` files in one directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::StoreError;
use crate::workflow::Workflow;

#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    dir: PathBuf,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

impl WorkflowCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.toml")))
    }

    /// Load a workflow. `Ok(None)` when no file exists for `id`.
    pub async fn load(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let path = self.path_for(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let workflow: Workflow = toml::from_str(&content).map_err(|e| StoreError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if workflow.id != id {
            return Err(StoreError::Parse {
                path,
                message: format!("file declares id '{}'", workflow.id),
            });
        }
        debug!(workflow_id = %id, steps = workflow.steps.len(), "Workflow loaded");
        Ok(Some(workflow))
    }

    /// IDs of every workflow file in the catalog, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && is_valid_id(stem)
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
