//! Object-store port: archived artifacts behind a public URL.

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use thiserror::Error;

/// Object-store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or refused the operation.
    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// The key is outside the store's namespace.
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// A pluggable object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object and returns its public URL.
    ///
    /// # Errors
    ///
    /// [`StorageError`] when the write fails.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Reads an object back; `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// [`StorageError`] when the read fails for another reason.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

/// Rejects keys that could escape the store's namespace.
pub(crate) fn check_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
