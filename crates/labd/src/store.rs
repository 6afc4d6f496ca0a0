//! Key-value persistence for the session lists.
//!
//! The registry never touches files directly. It goes through a
//! [`SessionStore`] wrapping an injected [`KeyValueBackend`], so tests can
//! run against [`MemoryBackend`] while the daemon uses [`JsonFileBackend`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::session::ServerItem;

/// Key of the recently used server list.
pub const RECENT_KEY: &str = "recentList";

/// Key of the running server cache.
pub const RUNNING_KEY: &str = "runningServers";

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store data is invalid: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Synchronous string-keyed JSON storage.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Store a value. Must be durable when this returns.
    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// All keys in one pretty-printed JSON object on disk.
pub struct JsonFileBackend {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonFileBackend {
    /// Open the file at `path`. A missing file starts empty; an unreadable
    /// or corrupt one is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(values) => values,
                Err(e) => {
                    warn!("[session-store] Ignoring corrupt {:?}: {}", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!("[session-store] Failed to read {:?}: {}", path, e);
                Map::new()
            }
        };
        Self { path, values }
    }
}

impl KeyValueBackend for JsonFileBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.values)?;

        // Write then rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("[session-store] Wrote {} to {:?}", key, self.path);
        Ok(())
    }
}

/// In-memory backend. Clones share the same storage, so a test can reopen
/// a store over the values a previous one wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Memory backend whose writes can be switched to fail.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct FailingBackend {
    inner: MemoryBackend,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FailingBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl KeyValueBackend for FailingBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.set(key, value)
    }
}

/// Typed access to the persisted server lists.
pub struct SessionStore {
    backend: Box<dyn KeyValueBackend>,
}

impl SessionStore {
    pub fn new(backend: impl KeyValueBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Store backed by `sessions.json` at `path`.
    pub fn open_file(path: impl Into<PathBuf>) -> Self {
        Self::new(JsonFileBackend::open(path))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Read a server list. Missing keys are an empty list; entries that do
    /// not parse are skipped.
    pub fn load_items(&self, key: &str) -> Result<Vec<ServerItem>, StoreError> {
        let Some(Value::Array(entries)) = self.backend.get(key)? else {
            return Ok(Vec::new());
        };

        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ServerItem>(entry) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("[session-store] Skipping invalid {} entry: {}", key, e);
                    None
                }
            })
            .collect())
    }

    pub fn save_items(&mut self, key: &str, items: &[ServerItem]) -> Result<(), StoreError> {
        self.backend.set(key, serde_json::to_value(items)?)
    }
}
