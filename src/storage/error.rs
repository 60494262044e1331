//! Blob Store Error Types

use std::io;
use thiserror::Error;

/// Blob store errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No blob stored under this key
    #[error("Blob not found: {0}")]
    Missing(String),

    /// Key rejected by the store
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_missing(&self) -> bool {
        match self {
            StorageError::Missing(_) => true,
            StorageError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
