//! Attachment content storage.

mod attachments;
mod local;
#[cfg(feature = "s3")]
mod s3;

pub use attachments::{validate_file_name, AttachmentFile, AttachmentStore};
pub use local::LocalStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("blob store error: {0}")]
    Internal(String),
}

/// Flat key/value storage for opaque content. Keys are `/`-separated.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or replace.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// `StoreError::NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn get_opt(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.get(key).await {
            Err(StoreError::NotFound(_)) => Ok(None),
            other => other.map(Some),
        }
    }

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        for key in self.list(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}

/// `tasks/<id>/attachments/`. The trailing slash keeps task 1 from matching
/// task 10.
pub fn task_attachments_prefix(task_id: i64) -> String {
    format!("tasks/{task_id}/attachments/")
}

pub fn attachment_key(task_id: i64, file_name: &str) -> String {
    format!("tasks/{task_id}/attachments/{file_name}")
}

/// Which blob backend to use. S3 wins when it is fully configured.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// S3-compatible endpoint, e.g. `http://127.0.0.1:3900` for Garage.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Root directory for the filesystem backend.
    pub local_data_dir: Option<String>,
}

fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

impl StoreConfig {
    /// Read `TASKWATCH_S3_*` (with `AWS_*` fallbacks) and
    /// `TASKWATCH_ATTACHMENTS_DIR`.
    pub fn from_env() -> Self {
        Self {
            endpoint_url: env_first(&["TASKWATCH_S3_ENDPOINT", "AWS_ENDPOINT_URL"]),
            region: env_first(&["TASKWATCH_S3_REGION", "AWS_REGION"]),
            bucket: env_first(&["TASKWATCH_S3_BUCKET"]),
            access_key_id: env_first(&["TASKWATCH_S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]),
            secret_access_key: env_first(&[
                "TASKWATCH_S3_SECRET_ACCESS_KEY",
                "AWS_SECRET_ACCESS_KEY",
            ]),
            local_data_dir: env_first(&["TASKWATCH_ATTACHMENTS_DIR"]),
        }
    }

    pub fn is_s3(&self) -> bool {
        [
            &self.endpoint_url,
            &self.bucket,
            &self.access_key_id,
            &self.secret_access_key,
        ]
        .iter()
        .all(|field| field.is_some())
    }
}

pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
    if !config.is_s3() {
        return Ok(Arc::new(LocalStore::new(config)));
    }
    #[cfg(feature = "s3")]
    {
        Ok(Arc::new(S3Store::new(config)?))
    }
    #[cfg(not(feature = "s3"))]
    {
        Err(StoreError::Internal(
            "S3 is configured but this build lacks the 's3' feature".into(),
        ))
    }
}
