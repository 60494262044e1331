//! Storage Module
//!
//! Blob/KV stores backing the adaptive result cache:
//! - [`FsBlobStore`]: one file per key under a root directory, atomic writes
//! - [`MemoryBlobStore`]: in-process map for tests and embedding
//!
//! Keys are flat names (`[A-Za-z0-9._-]`), so a key never escapes the store root.

pub mod error;
pub mod fs;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Byte store addressed by flat string keys.
///
/// Implementations must be safe to call concurrently for distinct keys.
pub trait BlobStore: Send + Sync {
    fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Returns [`StorageError::Missing`] when nothing is stored under `key`
    fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Deleting an absent key is not an error
    fn delete(&self, key: &str) -> StorageResult<()>;

    fn list(&self) -> StorageResult<Vec<String>>;
}

pub(crate) fn check_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
