use std::collections::HashMap;
use std::path::{Path, PathBuf};

use relay_common::CredentialId;
use tokio::sync::RwLock;

use crate::credential::TransientState;

/// Runtime health state held separately from the persisted credential data.
/// An optional disk snapshot lets a restart recover
/// in-flight cooldowns instead of treating every credential as fresh.
pub struct TransientStateCache {
    entries: RwLock<HashMap<CredentialId, TransientState>>,
    snapshot_path: Option<PathBuf>,
}

impl TransientStateCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    pub fn with_snapshot_path(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot_path: Some(path.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<TransientState> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn set(&self, id: impl Into<CredentialId>, state: TransientState) {
        self.entries.write().await.insert(id.into(), state);
    }

    pub async fn delete(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn get_or_create(&self, id: impl Into<CredentialId>) -> TransientState {
        let id = id.into();
        let mut guard = self.entries.write().await;
        guard.entry(id).or_default().clone()
    }

    /// Best-effort load: a missing, empty, or malformed snapshot yields an
    /// empty cache and a warning rather than a startup failure.
    pub async fn load(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
                Ok(loaded) => {
                    *self.entries.write().await = loaded;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "discarding malformed transient state snapshot");
                }
            },
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read transient state snapshot");
            }
        }
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over `<path>`.
    pub async fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.entries.read().await.clone();
        let bytes = serde_json::to_vec_pretty(&snapshot).unwrap_or_default();
        let tmp_path = tmp_path_for(path);
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

impl Default for TransientStateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
