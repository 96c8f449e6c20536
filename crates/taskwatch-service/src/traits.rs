use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use taskwatch_core::{CoreError, Task};
use taskwatch_db::DbError;
use taskwatch_store::{AttachmentFile, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DbError> for ServiceError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(msg) => ServiceError::NotFound(msg),
            DbError::InvalidInput(msg) => ServiceError::InvalidInput(msg),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => ServiceError::NotFound(msg),
            StoreError::InvalidKey(msg) => ServiceError::InvalidInput(msg),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(msg) => ServiceError::NotFound(msg),
            CoreError::InvalidInput(msg) => ServiceError::InvalidInput(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTask {
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub files: Vec<AttachmentFile>,
}

/// Full replacement of a task's editable state.
#[derive(Debug, Clone)]
pub struct UpdateTask {
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Every attachment the task should have afterwards, kept or new.
    pub attachment_names: Vec<String>,
    /// Content for the names in `attachment_names` that are new.
    pub files: Vec<AttachmentFile>,
}

/// Task operations on behalf of one user.
///
/// Every call is scoped to `user_id`; other users' tasks read as not found.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, user_id: &str, input: CreateTask) -> Result<Task, ServiceError>;

    async fn update_task(
        &self,
        user_id: &str,
        id: i64,
        update: UpdateTask,
    ) -> Result<Task, ServiceError>;

    async fn complete_task(&self, user_id: &str, id: i64) -> Result<Task, ServiceError>;

    async fn delete_task(&self, user_id: &str, id: i64) -> Result<(), ServiceError>;

    async fn get_task(&self, user_id: &str, id: i64) -> Result<Task, ServiceError>;

    async fn list_active(
        &self,
        user_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, ServiceError>;

    async fn list_completed(
        &self,
        user_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, ServiceError>;

    /// Attachment content, `None` when the task has no attachment by that name.
    async fn get_attachment(
        &self,
        user_id: &str,
        id: i64,
        file_name: &str,
    ) -> Result<Option<Bytes>, ServiceError>;
}
