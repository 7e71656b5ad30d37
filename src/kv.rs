use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{AppError, Result};

/// Durable JSON key-value storage backing the flag maps, the verification
/// cache and the cached credential snapshot.
///
/// A `put` replaces the whole value for one key atomically. Nothing spans
/// more than one key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> Result<()>;
}

/// In-process store used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreUnavailable` until
    /// switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_online()?;
        let entries = self
            .entries
            .lock()
            .map_err(|_| AppError::StoreUnavailable("memory store poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.check_online()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AppError::StoreUnavailable("memory store poisoned".to_string()))?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}
