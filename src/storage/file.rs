//! JSON-file backed key/value store
//!
//! The whole map lives in one file. Writes go to a sibling temp file which is
//! then renamed over the original, so a crash mid-save leaves either the old
//! or the new contents on disk.

use super::KeyValueStore;
use crate::error::StoreError;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

type Entries = BTreeMap<String, String>;

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: OnceCell<Mutex<Entries>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Result<&Mutex<Entries>, StoreError> {
        self.entries.get().ok_or(StoreError::NotInitialized)
    }

    fn read_entries(path: &Path) -> Result<Entries, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Ok(Entries::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::IoFailure(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(io_failure(path, e)),
        }
    }

    fn write_entries(&self, entries: &Entries) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| StoreError::IoFailure(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| io_failure(&tmp_path, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_failure(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| io_failure(&self.path, e))
    }
}

fn io_failure(path: &Path, error: std::io::Error) -> StoreError {
    StoreError::IoFailure(format!("{}: {error}", path.display()))
}

impl KeyValueStore for FileStore {
    fn init(&self) -> Result<(), StoreError> {
        self.entries.get_or_try_init(|| {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| io_failure(parent, e))?;
            }
            // Unreadable contents read as an empty store; the next save
            // replaces the file
            let entries = Self::read_entries(&self.path).unwrap_or_else(|e| {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Credential store unreadable, starting empty"
                );
                Entries::new()
            });
            info!(
                path = %self.path.display(),
                keys = entries.len(),
                "Credential store initialized"
            );
            Ok::<_, StoreError>(Mutex::new(entries))
        })?;
        Ok(())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries()?
            .lock()
            .map_err(|_| StoreError::IoFailure("store lock poisoned".to_string()))?;

        let mut updated = entries.clone();
        updated.insert(key.to_string(), value.to_string());
        self.write_entries(&updated)?;
        *entries = updated;

        debug!(key, "Stored value");
        Ok(())
    }

    fn load(&self, key: &str, capacity: usize) -> Result<String, StoreError> {
        let entries = self
            .entries()?
            .lock()
            .map_err(|_| StoreError::IoFailure("store lock poisoned".to_string()))?;

        let value = entries
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if value.len() > capacity {
            return Err(StoreError::BufferTooSmall {
                key: key.to_string(),
                len: value.len(),
                capacity,
            });
        }
        Ok(value.clone())
    }
}
