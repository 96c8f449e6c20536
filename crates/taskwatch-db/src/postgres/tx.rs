use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use taskwatch_core::{Scope, Task};

use super::{pg_err, queries};
use crate::{DbError, TaskRepository, Transaction};

/// A [`TaskRepository`] bound to one pooled Postgres transaction.
///
/// Dropping it without commit returns the connection to the pool and the
/// transaction is rolled back.
pub struct PostgresTransaction {
    tx: Mutex<sqlx::Transaction<'static, sqlx::Postgres>>,
}

impl PostgresTransaction {
    pub(crate) fn new(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    fn as_repository(&self) -> &dyn TaskRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.into_inner().commit().await.map_err(pg_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.into_inner().rollback().await.map_err(pg_err)
    }
}

#[async_trait]
impl TaskRepository for PostgresTransaction {
    async fn create_task(&self, scope: &Scope, task: &Task) -> Result<Task, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::create_task(&mut tx, scope, task).await
    }

    async fn update_task(&self, scope: &Scope, task: &Task) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::update_task(&mut tx, scope, task).await
    }

    async fn delete_task(&self, scope: &Scope, id: i64) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::delete_task(&mut tx, scope, id).await
    }

    async fn get_task(&self, scope: &Scope, id: i64) -> Result<Option<Task>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::get_task(&mut tx, scope, id).await
    }

    async fn get_active(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::get_active(&mut tx, scope, offset, limit).await
    }

    async fn get_completed(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::get_completed(&mut tx, scope, offset, limit).await
    }

    async fn get_expiring_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Task>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::get_expiring(&mut tx, scope, now, window).await
    }

    async fn get_expired_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::get_expired(&mut tx, scope, now).await
    }

    async fn purge_completed_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<i64>, DbError> {
        let mut tx = self.tx.lock().await;
        queries::tasks::purge_completed(&mut tx, scope, now - older_than).await
    }

    async fn update_attachments(
        &self,
        task_id: i64,
        inserted: &[String],
        deleted: &[i64],
    ) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        queries::attachments::update_attachments(&mut tx, task_id, inserted, deleted).await
    }
}
