//! Local file system key-value store
//!
//! Each key is a file inside `<root>/<namespace>/`. Writes go to a
//! temporary file in the same directory which is then renamed over the
//! target, so a crash mid-write leaves the previous value intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{validate_key, KeyValueStore, StorageError};

/// A durable store backed by one directory per namespace.
pub struct LocalStore {
    /// Directory holding this namespace's keys
    base_dir: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the namespace directory under `root`.
    pub fn open(root: impl AsRef<Path>, namespace: &str) -> Result<Self, StorageError> {
        validate_key(namespace)?;
        let base_dir = root.as_ref().join(namespace);
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Directory this store writes into.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Make the last rename durable. Only meaningful where directories
    /// can be opened and synced.
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), StorageError> {
        fs::File::open(&self.base_dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_dir.join(key))
    }
}

impl KeyValueStore for LocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let mut tmp = NamedTempFile::new_in(&self.base_dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::IoError(e.error))?;
        self.sync_dir()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
