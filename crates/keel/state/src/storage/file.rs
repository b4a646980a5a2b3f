//! File-backed state storage.
//!
//! Layout under the state directory:
//!
//! ```text
//! registry.json
//! stacks/<stack-id>.json
//! ```
//!
//! Every document is written to a temporary sibling and renamed over the
//! target, so a crash leaves either the old or the new document.

use super::traits::StateStore;
use crate::error::{Result, StateError};
use crate::snapshot::StackSnapshot;
use async_trait::async_trait;
use keel_registry::RegistrySnapshot;
use keel_types::StackId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const REGISTRY_FILE: &str = "registry.json";
const STACKS_DIR: &str = "stacks";

/// JSON documents under a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let stacks = root.join(STACKS_DIR);
        tokio::fs::create_dir_all(&stacks)
            .await
            .map_err(|e| StateError::io(&stacks, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn stack_path(&self, id: &StackId) -> Result<PathBuf> {
        let key = id.as_str();
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StateError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(STACKS_DIR).join(format!("{}.json", key)))
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state");
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StateError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StateError::io(path, e));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "State written");
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn read_stack(&self, path: &Path, expected: Option<&StackId>) -> Result<Option<StackSnapshot>> {
        let Some(snapshot) = self.read_json::<StackSnapshot>(path).await? else {
            return Ok(None);
        };
        if let Some(expected) = expected {
            if &snapshot.stack_id != expected {
                return Err(StateError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!(
                        "file holds stack {} instead of {}",
                        snapshot.stack_id, expected
                    ),
                });
            }
        }
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_registry(&self) -> Result<RegistrySnapshot> {
        Ok(self
            .read_json(&self.registry_path())
            .await?
            .unwrap_or_default())
    }

    async fn save_registry(&self, registry: &RegistrySnapshot) -> Result<()> {
        self.write_atomic(&self.registry_path(), registry).await
    }

    async fn load_stack(&self, id: &StackId) -> Result<Option<StackSnapshot>> {
        let path = self.stack_path(id)?;
        self.read_stack(&path, Some(id)).await
    }

    async fn save_stack(&self, snapshot: &StackSnapshot) -> Result<()> {
        let path = self.stack_path(&snapshot.stack_id)?;
        self.write_atomic(&path, snapshot).await
    }

    async fn delete_stack(&self, id: &StackId) -> Result<()> {
        let path = self.stack_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    async fn list_stacks(&self) -> Result<Vec<StackSnapshot>> {
        let dir = self.root.join(STACKS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&dir, e)),
        };

        let mut stacks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(&dir, e))?
        {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_snapshot {
                continue;
            }
            if let Some(snapshot) = self.read_stack(&path, None).await? {
                stacks.push(snapshot);
            }
        }
        stacks.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        Ok(stacks)
    }
}
