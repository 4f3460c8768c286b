//! Filesystem object store with a served public path.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{check_key, ObjectStore, StorageError};

/// Writes artifacts under a base directory and derives public URLs from a
/// configured prefix. The process serving that prefix is external.
pub struct LocalStorage {
    base_path: PathBuf,
    public_url: String,
}

impl LocalStorage {
    /// Creates the store; the base directory is created on first write.
    #[must_use]
    pub fn new(base_path: PathBuf, public_url: String) -> Self {
        Self {
            base_path,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        check_key(key)?;
        let path = self.base_path.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        Ok(format!("{}/{key}", self.public_url))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        match tokio::fs::read(self.base_path.join(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Unavailable(err.to_string())),
        }
    }
}
