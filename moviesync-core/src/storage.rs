//! Durable storage for the clock-offset record.
//!
//! The record is two scalars, so the file store writes a small JSON document
//! and replaces it atomically (write temp file, fsync, rename). The estimator
//! only sees the [`OffsetStore`] trait; tests and ephemeral nodes use
//! [`MemoryOffsetStore`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed namespace the record is stored under.
pub const STORE_NAMESPACE: &str = "time_sync_prefs";

/// Persisted estimator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// `coordinator_time ≈ local_time + offset_ms`
    pub offset_ms: i64,
    /// False until the first time-sync sample lands.
    pub has_sample: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Backing store for [`OffsetRecord`].
pub trait OffsetStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<OffsetRecord>, StoreError>;

    fn save(&self, record: &OffsetRecord) -> Result<(), StoreError>;
}

/// In-process store. Survives nothing; used by tests and throwaway nodes.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    record: Mutex<Option<OffsetRecord>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if a previous run had saved `record`.
    pub fn with_record(record: OffsetRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn load(&self) -> Result<Option<OffsetRecord>, StoreError> {
        let guard = self.record.lock().unwrap_or_else(|e| e.into_inner());
        Ok(*guard)
    }

    fn save(&self, record: &OffsetRecord) -> Result<(), StoreError> {
        let mut guard = self.record.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(*record);
        Ok(())
    }
}

/// JSON file store: `<dir>/time_sync_prefs.json`.
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    path: PathBuf,
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the fixed namespace inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{STORE_NAMESPACE}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| STORE_NAMESPACE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl OffsetStore for FileOffsetStore {
    fn load(&self) -> Result<Option<OffsetRecord>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(record))
    }

    fn save(&self, record: &OffsetRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_starts_empty() {
        let store = MemoryOffsetStore::new();
        assert_eq!(store.load().unwrap(), None);

        let record = OffsetRecord {
            offset_ms: -250,
            has_sample: true,
        };
        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::in_dir(dir.path());
        assert_eq!(store.load().unwrap(), None);
        assert!(store.path().ends_with("time_sync_prefs.json"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let record = OffsetRecord {
            offset_ms: 4_899_700,
            has_sample: true,
        };
        FileOffsetStore::in_dir(dir.path()).save(&record).unwrap();

        let reopened = FileOffsetStore::in_dir(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(record));
        assert!(!reopened.temp_path().exists(), "temp file renamed away");
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::in_dir(dir.path().join("nested").join("state"));
        store.save(&OffsetRecord::default()).unwrap();
        assert_eq!(store.load().unwrap(), Some(OffsetRecord::default()));
    }

    #[test]
    fn test_file_store_overwrites() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::in_dir(dir.path());
        store
            .save(&OffsetRecord {
                offset_ms: 1,
                has_sample: true,
            })
            .unwrap();
        store
            .save(&OffsetRecord {
                offset_ms: 2,
                has_sample: true,
            })
            .unwrap();
        assert_eq!(store.load().unwrap().unwrap().offset_ms, 2);
    }

    #[test]
    fn test_file_store_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::in_dir(dir.path());
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(
            store.load(),
            Err(StoreError::Deserialization(_))
        ));
    }
}
