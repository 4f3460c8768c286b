//! S3-compatible object store (AWS, MinIO).

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use secrecy::ExposeSecret;

use super::{check_key, ObjectStore, StorageError};
use crate::config::StorageConfig;

/// S3 client scoped to one bucket.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base: String,
}

impl S3Storage {
    /// Builds the client from the storage configuration.
    ///
    /// Path-style addressing is forced: MinIO and most self-hosted stores
    /// do not resolve virtual-host buckets.
    pub async fn new(config: &StorageConfig) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.expose_secret().clone(),
            None,
            None,
            "emissor-static",
        );
        let endpoint = normalize_endpoint(&config.endpoint, config.use_ssl);

        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint.clone())
            .credentials_provider(credentials)
            .region(aws_config::Region::new("us-east-1"))
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            public_base: format!("{endpoint}/{}", config.bucket),
        }
    }
}

fn normalize_endpoint(endpoint: &str, use_ssl: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        let scheme = if use_ssl { "https" } else { "http" };
        format!("{scheme}://{}", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        check_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        Ok(format!("{}/{key}", self.public_base))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let service_error = err.as_service_error();
                if service_error.is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(StorageError::Unavailable(err.to_string()));
            },
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            normalize_endpoint("localhost:9000", false),
            "http://localhost:9000"
        );
        assert_eq!(
            normalize_endpoint("minio.internal:9000", true),
            "https://minio.internal:9000"
        );
        assert_eq!(
            normalize_endpoint("https://s3.amazonaws.com/", true),
            "https://s3.amazonaws.com"
        );
    }
}
