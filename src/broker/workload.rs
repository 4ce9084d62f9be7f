//! On-disk storage for submitted workload files

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;

/// Writes each workload once, as `<uuid>.py`, under a single directory
#[derive(Debug, Clone)]
pub struct WorkloadStore {
    dir: PathBuf,
}

impl WorkloadStore {
    /// Open the store, creating `dir` if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BrokerError::Storage(format!("Failed to create task dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.py", id))
    }

    /// Store `contents` under a fresh name. Never overwrites an existing file.
    pub async fn save(&self, contents: &str) -> Result<PathBuf, BrokerError> {
        let path = self.path_for(Uuid::new_v4());

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| storage_error("create", &path, e))?;

        let written = match file.write_all(contents.as_bytes()).await {
            Ok(()) => file.flush().await.map_err(|e| ("flush", e)),
            Err(e) => Err(("write", e)),
        };
        drop(file);
        self.discard_on_error(&path, written).await?;

        debug!(path = %path.display(), bytes = contents.len(), "Workload stored");
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<String, BrokerError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| storage_error("read", path, e))
    }

    /// Remove a partly written file when writing it failed
    async fn discard_on_error(
        &self,
        path: &Path,
        written: Result<(), (&'static str, std::io::Error)>,
    ) -> Result<(), BrokerError> {
        if let Err((action, e)) = written {
            self.remove(path).await;
            return Err(storage_error(action, path, e));
        }
        Ok(())
    }

    /// Best-effort removal; a missing file is not an error
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), "Failed to remove workload: {}", e);
        }
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> BrokerError {
    BrokerError::Storage(format!(
        "Failed to {} workload {}: {}",
        action,
        path.display(),
        err
    ))
}
