use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use crate::{BlobStore, StoreConfig, StoreError};

const DEFAULT_REGION: &str = "us-east-1";

/// Attachment blobs in an S3-compatible bucket (Garage, MinIO, AWS),
/// addressed path-style.
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket.name())
            .finish_non_exhaustive()
    }
}

impl S3Store {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let name = config
            .bucket
            .as_deref()
            .ok_or_else(|| StoreError::Internal("S3 bucket name is not configured".into()))?;
        let endpoint = config
            .endpoint_url
            .clone()
            .ok_or_else(|| StoreError::Internal("S3 endpoint is not configured".into()))?;
        let region = Region::Custom {
            region: config
                .region
                .clone()
                .unwrap_or_else(|| DEFAULT_REGION.into()),
            endpoint,
        };
        let credentials = Credentials::new(
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StoreError::Internal(format!("S3 credentials: {e}")))?;

        let mut bucket = Bucket::new(name, region, credentials)
            .map_err(|e| StoreError::Internal(format!("S3 bucket {name}: {e}")))?;
        bucket.set_path_style();
        Ok(Self { bucket })
    }
}

/// Turn a non-success status into an error; 404 becomes `NotFound`.
fn check_status(op: &str, key: &str, status: u16) -> Result<(), StoreError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StoreError::NotFound(key.to_string())),
        _ => Err(StoreError::Internal(format!("S3 {op} {key}: status {status}"))),
    }
}

fn request_error(op: &str, key: &str, e: s3::error::S3Error) -> StoreError {
    StoreError::Internal(format!("S3 {op} {key}: {e}"))
}

/// Content type stored with an attachment, from its file extension.
fn content_type(file_name: &str) -> &'static str {
    let ext = match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, content_type(key))
            .await
            .map_err(|e| request_error("put", key, e))?;
        check_status("put", key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| request_error("get", key, e))?;
        check_status("get", key, response.status_code())?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| request_error("delete", key, e))?;
        match check_status("delete", key, response.status_code()) {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| request_error("list", prefix, e))?;
        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .collect();
        keys.sort();
        debug!("S3 list {prefix}: {} key(s)", keys.len());
        Ok(keys)
    }
}
