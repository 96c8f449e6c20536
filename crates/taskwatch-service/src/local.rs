use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{info, warn};

use taskwatch_core::{reconcile_attachments, Scope, Task};
use taskwatch_db::{transact, Database, TaskRepository};
use taskwatch_store::{validate_file_name, AttachmentFile, AttachmentStore};

use crate::{CreateTask, ServiceError, TaskService, UpdateTask};

/// Service backed by a task store and an attachment blob store.
///
/// Attachment metadata is committed first and blob content mirrored
/// afterwards. A failure in between can leave orphaned blobs, or rows whose
/// content is missing; the error is returned to the caller in the latter case.
pub struct LocalService {
    db: Arc<dyn Database>,
    attachments: AttachmentStore,
}

impl LocalService {
    pub fn new(db: Arc<dyn Database>, attachments: AttachmentStore) -> Self {
        Self { db, attachments }
    }

    async fn load(&self, scope: &Scope, id: i64) -> Result<Task, ServiceError> {
        self.db
            .get_task(scope, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))
    }

    async fn save_files(&self, task_id: i64, files: &[AttachmentFile]) -> Result<(), ServiceError> {
        if files.is_empty() {
            return Ok(());
        }
        self.attachments
            .save_attachments(task_id, files)
            .await
            .map_err(|e| {
                ServiceError::Internal(format!(
                    "task {task_id} saved but attachment upload failed: {e}"
                ))
            })
    }
}

/// Check submitted names and make sure every file has a matching name.
fn check_attachments(names: &[String], files: &[AttachmentFile]) -> Result<(), ServiceError> {
    for name in names {
        validate_file_name(name)?;
    }
    let names: HashSet<&str> = names.iter().map(String::as_str).collect();
    for file in files {
        if !names.contains(file.file_name.as_str()) {
            return Err(ServiceError::InvalidInput(format!(
                "file '{}' is not in the attachment list",
                file.file_name
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TaskService for LocalService {
    async fn create_task(&self, user_id: &str, input: CreateTask) -> Result<Task, ServiceError> {
        let scope = Scope::user(user_id);
        let names: Vec<String> = input.files.iter().map(|f| f.file_name.clone()).collect();
        check_attachments(&names, &input.files)?;
        let inserted = reconcile_attachments(&[], &names).inserted;

        let task = Task::new(input.name, input.expires_at);
        task.validate()?;

        let tx_scope = scope.clone();
        let id = transact(&*self.db, move |repo| {
            Box::pin(async move {
                let created = repo.create_task(&tx_scope, &task).await?;
                repo.update_attachments(created.id, &inserted, &[]).await?;
                Ok(created.id)
            })
        })
        .await?;

        self.save_files(id, &input.files).await?;
        info!("user {user_id} created task {id}");
        self.load(&scope, id).await
    }

    async fn update_task(
        &self,
        user_id: &str,
        id: i64,
        update: UpdateTask,
    ) -> Result<Task, ServiceError> {
        let scope = Scope::user(user_id);
        check_attachments(&update.attachment_names, &update.files)?;

        let mut task = self.load(&scope, id).await?;
        task.update(update.name, update.expires_at);
        task.validate()?;
        let changes = reconcile_attachments(&task.attachments, &update.attachment_names);
        let inserted: HashSet<&str> = changes.inserted.iter().map(String::as_str).collect();
        if let Some(missing) = changes
            .inserted
            .iter()
            .find(|name| !update.files.iter().any(|f| &f.file_name == *name))
        {
            return Err(ServiceError::InvalidInput(format!(
                "new attachment '{missing}' has no content"
            )));
        }
        // Content for names that already exist is left as stored.
        let uploads: Vec<AttachmentFile> = update
            .files
            .into_iter()
            .filter(|f| inserted.contains(f.file_name.as_str()))
            .collect();

        {
            let scope = scope.clone();
            let task = task.clone();
            let new_names = changes.inserted.clone();
            let deleted_ids = changes.deleted_ids();
            transact(&*self.db, move |repo| {
                Box::pin(async move {
                    repo.update_task(&scope, &task).await?;
                    repo.update_attachments(task.id, &new_names, &deleted_ids)
                        .await
                })
            })
            .await?;
        }

        self.save_files(id, &uploads).await?;
        if let Err(e) = self
            .attachments
            .delete_attachments(id, &changes.deleted_names())
            .await
        {
            warn!("task {id}: removed attachments left behind in blob store: {e}");
        }

        self.load(&scope, id).await
    }

    async fn complete_task(&self, user_id: &str, id: i64) -> Result<Task, ServiceError> {
        let scope = Scope::user(user_id);
        let mut task = self.load(&scope, id).await?;
        if task.is_completed() {
            return Ok(task);
        }
        task.set_completed(Utc::now());
        self.db.update_task(&scope, &task).await?;
        info!("user {user_id} completed task {id}");
        Ok(task)
    }

    async fn delete_task(&self, user_id: &str, id: i64) -> Result<(), ServiceError> {
        let scope = Scope::user(user_id);
        transact(&*self.db, move |repo| {
            Box::pin(async move { repo.delete_task(&scope, id).await })
        })
        .await?;

        if let Err(e) = self.attachments.delete_task(id).await {
            warn!("task {id} deleted but its attachments were not: {e}");
        }
        info!("user {user_id} deleted task {id}");
        Ok(())
    }

    async fn get_task(&self, user_id: &str, id: i64) -> Result<Task, ServiceError> {
        self.load(&Scope::user(user_id), id).await
    }

    async fn list_active(
        &self,
        user_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, ServiceError> {
        Ok(self
            .db
            .get_active(&Scope::user(user_id), offset, limit)
            .await?)
    }

    async fn list_completed(
        &self,
        user_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, ServiceError> {
        Ok(self
            .db
            .get_completed(&Scope::user(user_id), offset, limit)
            .await?)
    }

    async fn get_attachment(
        &self,
        user_id: &str,
        id: i64,
        file_name: &str,
    ) -> Result<Option<Bytes>, ServiceError> {
        let Some(task) = self.db.get_task(&Scope::user(user_id), id).await? else {
            return Ok(None);
        };
        if !task.attachments.iter().any(|a| a.file_name == file_name) {
            return Ok(None);
        }
        Ok(self.attachments.get_attachment(id, file_name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> AttachmentFile {
        AttachmentFile::new(name, "x")
    }

    #[test]
    fn files_must_be_listed() {
        let names = vec!["a".to_string()];
        assert!(check_attachments(&names, &[file("a")]).is_ok());
        assert!(matches!(
            check_attachments(&names, &[file("b")]),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn unsafe_names_are_invalid_input() {
        let names = vec!["../etc".to_string()];
        assert!(matches!(
            check_attachments(&names, &[]),
            Err(ServiceError::InvalidInput(_))
        ));
    }
}
