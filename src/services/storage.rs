use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};
use std::path::Path;
use tempfile::TempPath;

/// Bucketed blob store holding input audio and JSON results.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn container_exists(&self, container: &str) -> Result<bool, StorageError>;

    async fn create_container(&self, container: &str) -> Result<(), StorageError>;

    async fn get_bytes(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Upload, replacing any existing object under `key`.
    async fn write_bytes(&self, container: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Create the container if absent. Safe to call repeatedly.
    async fn ensure_container(&self, container: &str) -> Result<(), StorageError> {
        tracing::info!(bucket = container, "Checking bucket exists");
        if self.container_exists(container).await? {
            tracing::info!(bucket = container, "Bucket already exists");
        } else {
            self.create_container(container).await?;
            tracing::info!(bucket = container, "Bucket created");
        }
        Ok(())
    }

    /// Download into a uniquely named temporary file. The file is deleted when
    /// the returned path is dropped.
    async fn fetch_to_local(&self, container: &str, key: &str) -> Result<TempPath, StorageError> {
        let data = self.get_bytes(container, key).await?;

        let suffix = Path::new(key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let path = tempfile::Builder::new()
            .prefix("artifact-")
            .suffix(&suffix)
            .tempfile()?
            .into_temp_path();
        tokio::fs::write(&path, &data).await?;

        tracing::debug!(
            bucket = container,
            key,
            local_path = %path.display(),
            bytes = data.len(),
            "Fetched object to local file"
        );
        Ok(path)
    }
}

/// Client for MinIO or any other S3-compatible store.
pub struct S3Store {
    region: Region,
    credentials: Credentials,
}

impl S3Store {
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        secure: bool,
    ) -> Result<Self, StorageError> {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            let scheme = if secure { "https" } else { "http" };
            format!("{scheme}://{endpoint}")
        };

        let region = Region::Custom {
            region: "us-east-1".to_string(),
            endpoint,
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn container_exists(&self, container: &str) -> Result<bool, StorageError> {
        Ok(self.bucket(container)?.exists().await?)
    }

    async fn create_container(&self, container: &str) -> Result<(), StorageError> {
        let response = Bucket::create_with_path_style(
            container,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await?;

        if !response.success() {
            return Err(StorageError::Status {
                code: response.response_code,
                key: container.to_string(),
            });
        }
        Ok(())
    }

    async fn get_bytes(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = match self.bucket(container)?.get_object(key).await {
            Ok(response) => response,
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => {
                return Err(StorageError::not_found(container, key));
            }
            Err(e) => return Err(e.into()),
        };

        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(StorageError::not_found(container, key)),
            code => Err(StorageError::Status {
                code,
                key: key.to_string(),
            }),
        }
    }

    async fn write_bytes(&self, container: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        tracing::info!(bucket = container, key, bytes = data.len(), "Writing object");
        let response = self
            .bucket(container)?
            .put_object_with_content_type(key, data, "application/json")
            .await?;

        match response.status_code() {
            200..=299 => Ok(()),
            code => Err(StorageError::Status {
                code,
                key: key.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object '{key}' not found in bucket '{container}'")]
    NotFound { container: String, key: String },

    #[error("Storage returned status {code} for '{key}'")]
    Status { code: u16, key: String },

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn not_found(container: &str, key: &str) -> Self {
        Self::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        }
    }
}
