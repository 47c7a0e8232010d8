use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create state directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable get/set of one serialized blob. Implementations must make `save`
/// atomic: a reader sees either the old blob or the new one.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>, StoreError>;
    async fn save(&self, blob: String) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(raw))
    }

    async fn save(&self, blob: String) -> Result<(), StoreError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent_dir.to_path_buf(),
                    source,
                })?;
        }

        let temp_path = self.temp_path();
        fs::write(&temp_path, blob)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// In-process store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    blob: Mutex<Option<String>>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
            saves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn blob(&self) -> Option<String> {
        self.blob.lock().clone()
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.blob.lock().clone())
    }

    async fn save(&self, blob: String) -> Result<(), StoreError> {
        *self.blob.lock() = Some(blob);
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{FileStateStore, MemoryStateStore, StateStore, StoreError};

    #[tokio::test]
    async fn missing_state_file_loads_nothing() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = FileStateStore::new(temp_dir.path().join("state.json"));

        assert!(store.load().await.expect("load should succeed").is_none());
    }

    #[tokio::test]
    async fn unreadable_state_path_reports_read_error() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = FileStateStore::new(temp_dir.path());

        let err = store.load().await.expect_err("a directory is not a state file");
        assert!(matches!(err, StoreError::Read { ref path, .. } if path == temp_dir.path()));
    }

    #[tokio::test]
    async fn save_creates_parent_dirs_and_replaces_blob() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("nested").join("state.json");
        let store = FileStateStore::new(&path);

        store
            .save("{\"autoConnectEnabled\":false}".to_string())
            .await
            .expect("first save should succeed");
        store
            .save("{\"autoConnectEnabled\":true}".to_string())
            .await
            .expect("second save should succeed");

        let loaded = store.load().await.expect("load should succeed");
        assert_eq!(loaded.as_deref(), Some("{\"autoConnectEnabled\":true}"));
        assert!(!path.with_file_name("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn memory_store_counts_saves() {
        let store = MemoryStateStore::new();
        store.save("a".to_string()).await.expect("save");
        store.save("b".to_string()).await.expect("save");

        assert_eq!(store.blob().as_deref(), Some("b"));
        assert_eq!(store.save_count(), 2);
    }
}
