//! Blob storage operator initialization and access
//!
//! Thin wrapper around an OpenDAL operator that applies the configured key
//! prefix and exposes streamed writes for archive uploads.

use edgestat_config::{StorageBackend, StorageConfig};
use opendal::{Operator, Writer};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct BlobStore {
    operator: Operator,
    prefix: String,
}

impl BlobStore {
    /// Build the operator for the configured backend.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let operator = match config.backend {
            StorageBackend::Fs => {
                let fs = config.fs.as_ref().ok_or_else(|| {
                    StorageError::Config("fs config required for filesystem backend".to_string())
                })?;
                let builder = opendal::services::Fs::default().root(&fs.path);
                Operator::new(builder)?.finish()
            }
            StorageBackend::S3 => {
                let s3 = config.s3.as_ref().ok_or_else(|| {
                    StorageError::Config("s3 config required for S3 backend".to_string())
                })?;
                let mut builder = opendal::services::S3::default()
                    .bucket(&s3.bucket)
                    .region(&s3.region);
                if let Some(endpoint) = &s3.endpoint {
                    builder = builder.endpoint(endpoint);
                }
                Operator::new(builder)?.finish()
            }
            StorageBackend::Memory => Operator::new(opendal::services::Memory::default())?.finish(),
        };

        tracing::debug!(backend = %config.backend, prefix = config.prefix(), "Blob store initialized");
        Ok(Self {
            operator,
            prefix: config.prefix().to_string(),
        })
    }

    /// In-memory store (for tests).
    pub fn memory() -> Result<Self> {
        Ok(Self {
            operator: Operator::new(opendal::services::Memory::default())?.finish(),
            prefix: String::new(),
        })
    }

    /// Full key for `relative`, with the configured prefix.
    pub fn key(&self, relative: &str) -> String {
        format!("{}{}", self.prefix, relative)
    }

    /// Open a streamed writer at a full key.
    pub async fn writer(&self, key: &str) -> Result<Writer> {
        Ok(self.operator.writer(key).await?)
    }

    pub async fn write(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.operator.write(key, body).await?;
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.operator.read(key).await?.to_vec())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.operator.exists(key).await?)
    }

    pub async fn size(&self, key: &str) -> Result<u64> {
        Ok(self.operator.stat(key).await?.content_length())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.operator.delete(key).await?;
        Ok(())
    }
}
