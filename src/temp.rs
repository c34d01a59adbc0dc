//! Temp Resource Manager: on-disk artifacts scoped to one job.
//!
//! Downloaded PDFs and rendered page images are written through a
//! [`TempScope`]. The scope remembers every path it handed out; the state
//! machine calls [`TempScope::release`] exactly once when the job reaches a
//! terminal state, whatever that state is. Deletion is best-effort: a file
//! that cannot be removed is logged as a [`ResourceError`] and the job
//! outcome is left alone.

use crate::error::{ResourceError, StageError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where artifacts live. `write` must return a path no other call returns.
#[async_trait]
pub trait TempStorage: Send + Sync {
    async fn write(&self, bytes: &[u8], extension: &str) -> Result<PathBuf, StageError>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StageError>;

    async fn delete(&self, path: &Path) -> Result<(), ResourceError>;
}

/// Artifacts as plain files in one directory.
///
/// Created either inside a fresh [`TempDir`] (removed with the storage) or in
/// a caller-supplied directory that outlives it.
pub struct DiskTempStorage {
    root: PathBuf,
    _owned: Option<TempDir>,
}

impl DiskTempStorage {
    /// A new private directory under the system temp dir.
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("pdf-ingest-").tempdir()?;
        Ok(Self {
            root: dir.path().to_path_buf(),
            _owned: Some(dir),
        })
    }

    /// Use (and create if needed) an existing directory.
    pub fn in_dir(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, _owned: None })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl TempStorage for DiskTempStorage {
    async fn write(&self, bytes: &[u8], extension: &str) -> Result<PathBuf, StageError> {
        let path = self.root.join(format!("{}.{extension}", Uuid::new_v4()));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StageError::TempStorage {
                detail: format!("write {}: {e}", path.display()),
            })?;
        Ok(path)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StageError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StageError::TempStorage {
                detail: format!("read {}: {e}", path.display()),
            })
    }

    async fn delete(&self, path: &Path) -> Result<(), ResourceError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResourceError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// The cleanup list of one job.
pub struct TempScope {
    storage: Arc<dyn TempStorage>,
    job_id: Uuid,
    paths: Mutex<Vec<PathBuf>>,
}

impl TempScope {
    pub fn new(storage: Arc<dyn TempStorage>, job_id: Uuid) -> Self {
        Self {
            storage,
            job_id,
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Write an artifact and register it for cleanup.
    pub async fn write(&self, bytes: &[u8], extension: &str) -> Result<PathBuf, StageError> {
        let path = self.storage.write(bytes, extension).await?;
        self.paths.lock().await.push(path.clone());
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, StageError> {
        self.storage.read(path).await
    }

    /// Delete a subset early (e.g. pages from an abandoned render attempt).
    pub async fn discard(&self, doomed: &[PathBuf]) {
        let mut paths = self.paths.lock().await;
        for path in doomed {
            if let Err(e) = self.storage.delete(path).await {
                warn!(job_id = %self.job_id, error = %e, "Temp cleanup failed");
            }
        }
        paths.retain(|p| !doomed.contains(p));
    }

    pub async fn len(&self) -> usize {
        self.paths.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.paths.lock().await.is_empty()
    }

    /// Delete every registered artifact. Returns how many deletions failed.
    pub async fn release(&self) -> usize {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.paths.lock().await);
        let mut failed = 0;
        for path in &paths {
            if let Err(e) = self.storage.delete(path).await {
                failed += 1;
                warn!(job_id = %self.job_id, error = %e, "Temp cleanup failed");
            }
        }
        debug!(
            job_id = %self.job_id,
            released = paths.len() - failed,
            failed,
            "Temp artifacts released"
        );
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_deletes_everything_written() {
        let storage = Arc::new(DiskTempStorage::new().unwrap());
        let root = storage.root().to_path_buf();
        let scope = TempScope::new(storage.clone(), Uuid::new_v4());

        let a = scope.write(b"%PDF-1.7", "pdf").await.unwrap();
        let b = scope.write(b"png", "png").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(scope.read(&a).await.unwrap(), b"%PDF-1.7");
        assert_eq!(scope.len().await, 2);

        assert_eq!(scope.release().await, 0);
        assert!(scope.is_empty().await);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_not_a_cleanup_failure() {
        let storage = Arc::new(DiskTempStorage::new().unwrap());
        let scope = TempScope::new(storage, Uuid::new_v4());
        let a = scope.write(b"x", "bin").await.unwrap();
        std::fs::remove_file(&a).unwrap();
        assert_eq!(scope.release().await, 0);
    }

    #[tokio::test]
    async fn discard_removes_only_the_given_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DiskTempStorage::in_dir(dir.path()).unwrap());
        let scope = TempScope::new(storage, Uuid::new_v4());
        let keep = scope.write(b"pdf", "pdf").await.unwrap();
        let drop_me = scope.write(b"png", "png").await.unwrap();

        scope.discard(&[drop_me.clone()]).await;
        assert!(keep.exists());
        assert!(!drop_me.exists());
        assert_eq!(scope.len().await, 1);
    }
}
