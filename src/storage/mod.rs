//! Durable key-value persistence for voxsync
//!
//! The offline write queue keeps its serialized contents here so that
//! queued writes survive process restarts. Stores are namespaced: two
//! stores opened with different namespaces never see each other's keys.

pub mod local;
pub mod memory;

use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Error types for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// A namespaced, durable string key-value store.
///
/// Implementations must have persisted the value by the time `set`
/// returns `Ok`.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the namespace directory.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
