//! In-process blob store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::error::{StorageError, StorageResult};
use super::{check_key, BlobStore};

/// Blob store kept in a map. Can be switched offline to exercise
/// storage failure paths.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with an I/O error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "blob store offline",
            )))
        } else {
            Ok(())
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        self.check_online()?;
        check_key(key)?;
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.check_online()?;
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::Missing(key.to_string()))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_online()?;
        self.blobs.lock().remove(key);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        self.check_online()?;
        let mut keys: Vec<String> = self.blobs.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryBlobStore::new();
        assert!(store.is_empty());

        store.write("k1", b"v1").unwrap();
        store.write("k0", b"v0").unwrap();
        assert_eq!(store.read("k1").unwrap(), b"v1");
        assert_eq!(store.list().unwrap(), vec!["k0".to_string(), "k1".to_string()]);

        store.delete("k1").unwrap();
        assert!(store.read("k1").unwrap_err().is_missing());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_offline_store_fails() {
        let store = MemoryBlobStore::new();
        store.set_offline(true);
        assert!(store.write("k", b"v").is_err());
        assert!(store.list().is_err());
        store.set_offline(false);
        assert!(store.write("k", b"v").is_ok());
    }
}
