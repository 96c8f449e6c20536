use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::{attachment_key, task_attachments_prefix, BlobStore, StoreError};

/// Content of one uploaded attachment.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub file_name: String,
    pub data: Bytes,
}

impl AttachmentFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }
}

/// Attachment content keyed by task id and file name.
///
/// This is the non-transactional half of an attachment change: callers
/// commit metadata first and then mirror it here, tolerating orphans.
#[derive(Clone)]
pub struct AttachmentStore {
    blobs: Arc<dyn BlobStore>,
}

impl AttachmentStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn get_attachment(&self, task_id: i64, file_name: &str) -> Result<Option<Bytes>, StoreError> {
        validate_file_name(file_name)?;
        self.blobs.get_opt(&attachment_key(task_id, file_name)).await
    }

    pub async fn save_attachments(&self, task_id: i64, files: &[AttachmentFile]) -> Result<(), StoreError> {
        for file in files {
            validate_file_name(&file.file_name)?;
        }
        for file in files {
            self.blobs
                .put(&attachment_key(task_id, &file.file_name), file.data.clone())
                .await?;
        }
        Ok(())
    }

    /// Delete the named files. Keeps going past individual failures and
    /// reports the first one.
    pub async fn delete_attachments(&self, task_id: i64, file_names: &[String]) -> Result<(), StoreError> {
        let mut first_err = None;
        for name in file_names {
            let result = match validate_file_name(name) {
                Ok(()) => self.blobs.delete(&attachment_key(task_id, name)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("deleting attachment {name} of task {task_id} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every attachment of a task.
    pub async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        self.blobs
            .delete_prefix(&task_attachments_prefix(task_id))
            .await
    }

    /// File names stored for a task, sorted.
    pub async fn list_attachments(&self, task_id: i64) -> Result<Vec<String>, StoreError> {
        let prefix = task_attachments_prefix(task_id);
        let keys = self.blobs.list(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

/// Attachment names become a single key segment, so separators, `.`/`..`
/// and NUL are rejected.
pub fn validate_file_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidKey(format!("attachment name '{name}'")));
    }
    Ok(())
}
