//! The durable key/value capability and the failure-absorbing handle the
//! stores use on top of it.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

/// Errors from a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("quota exceeded writing {key}: {needed} bytes needed, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous string key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store with an optional byte quota over keys plus values.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries();
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(used);
            if needed > available {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available,
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One JSON file per key under a base directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create the base directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{file_name}.json"))
    }

    /// Write via a `.tmp` sibling so readers never see a torn file.
    fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Self::atomic_write(&self.path_for(key), value.as_bytes())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct HandleState {
    degraded: bool,
    /// Writes made after degrading. `None` marks a removal.
    overlay: HashMap<String, Option<String>>,
}

/// Typed, failure-absorbing access to a [`KeyValueStore`].
///
/// Every operation runs under one mutex, so a read-modify-write of a record
/// never interleaves with another writer. The first failed write flips the
/// handle into degraded mode: later writes land in an in-memory overlay and
/// reads consult it first.
pub struct StorageHandle {
    backend: Arc<dyn KeyValueStore>,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl StorageHandle {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            state: Mutex::default(),
        }
    }

    /// Whether writes have fallen back to memory.
    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// Read and decode a record. Missing or undecodable records read as `None`.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut state = self.lock();
        self.read_locked(&mut state, key)
    }

    /// Raw JSON view of a record, for callers that reshape old data.
    pub fn read_value(&self, key: &str) -> Option<serde_json::Value> {
        self.read(key)
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) {
        let mut state = self.lock();
        self.write_locked(&mut state, key, value);
    }

    pub fn remove(&self, key: &str) {
        let mut state = self.lock();
        self.remove_locked(&mut state, key);
    }

    /// Remove several keys without any reader observing a partial clear.
    pub fn remove_all(&self, keys: &[&str]) {
        let mut state = self.lock();
        for key in keys {
            self.remove_locked(&mut state, key);
        }
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` sees the current value (`None` if absent or undecodable). Leaving
    /// `Some` writes it back; setting `None` removes the key.
    pub fn update<T, R>(&self, key: &str, f: impl FnOnce(&mut Option<T>) -> R) -> R
    where
        T: Serialize + DeserializeOwned,
    {
        let mut state = self.lock();
        let mut current: Option<T> = self.read_locked(&mut state, key);
        let out = f(&mut current);
        match &current {
            Some(value) => self.write_locked(&mut state, key, value),
            None => self.remove_locked(&mut state, key),
        }
        out
    }

    fn read_locked<T: DeserializeOwned>(&self, state: &mut HandleState, key: &str) -> Option<T> {
        let raw = match state.overlay.get(key) {
            Some(entry) => entry.clone(),
            None => match self.backend.get(key) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key, error = %e, "storage read failed, treating as empty");
                    None
                }
            },
        }?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "stored record is corrupt, ignoring it");
                None
            }
        }
    }

    fn write_locked<T: Serialize>(&self, state: &mut HandleState, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize record, write skipped");
                return;
            }
        };
        if state.degraded {
            state.overlay.insert(key.to_string(), Some(raw));
            return;
        }
        if let Err(e) = self.backend.set(key, &raw) {
            warn!(key, error = %e, "storage write failed, continuing in memory");
            state.degraded = true;
            state.overlay.insert(key.to_string(), Some(raw));
        }
    }

    fn remove_locked(&self, state: &mut HandleState, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            warn!(key, error = %e, "storage remove failed");
        }
        if state.degraded {
            state.overlay.insert(key.to_string(), None);
        } else {
            debug!(key, "removed record");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
