//! In-memory store, for tests and for clients that opt out of durability.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{validate_key, KeyValueStore, StorageError};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))?;
        entries.remove(key);
        Ok(())
    }
}
