//! Durable key-value backends for the token store.
//!
//! The API mirrors a small plugin-style store: values are JSON, writes are
//! buffered until `save`, and every call can fail. Callers in the session
//! core treat failures as best-effort and never surface them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by a key-value backend
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend refused the operation (disabled, quota, permissions)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage contents could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A writer panicked while holding the lock
    #[error("Storage lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Minimal durable key-value interface the token store is written against
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Write a value (visible to readers immediately, durable after `save`)
    fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Whether a key is present
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Remove a key, returning whether it existed
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// All keys currently held
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Flush buffered writes to durable storage
    fn save(&self) -> StorageResult<()>;
}

/// In-memory backend used by tests and when no durable storage exists
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    fn save(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// JSON-file backend.
///
/// The whole document is cached in memory; `save` rewrites it atomically
/// through a uniquely named temp file followed by a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Value>>,
}

impl FileStore {
    /// Open (or lazily create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            debug!(path = %path.display(), "No session store file yet, starting empty");
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.remove(key).is_some())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.keys().cloned().collect())
    }

    fn save(&self) -> StorageResult<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let json = {
            let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
            serde_json::to_string_pretty(&*entries)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Unique temp name so concurrent saves never share a half-written file
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        if let Err(e) =
            std::fs::write(&tmp_path, json).and_then(|_| std::fs::rename(&tmp_path, &self.path))
        {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(path = %self.path.display(), "Session store saved");
        Ok(())
    }
}

/// Backend that rejects every operation.
///
/// Models a host that denies durable storage; the session core must keep
/// working in a degraded, session-less form on top of it.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!(reason = %reason, "Durable session storage is unavailable");
        Self { reason }
    }

    fn err(&self) -> StorageError {
        StorageError::Unavailable(self.reason.clone())
    }
}

impl KeyValueStore for UnavailableStore {
    fn get(&self, _key: &str) -> StorageResult<Option<Value>> {
        Err(self.err())
    }

    fn set(&self, _key: &str, _value: Value) -> StorageResult<()> {
        Err(self.err())
    }

    fn delete(&self, _key: &str) -> StorageResult<bool> {
        Err(self.err())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Err(self.err())
    }

    fn save(&self) -> StorageResult<()> {
        Err(self.err())
    }
}
