use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use taskwatch_core::{Scope, Task};

use super::{queries, SqliteResultExt};
use crate::{DbError, TaskRepository, Transaction};

/// Exclusive connection inside `BEGIN`. Rolls back if dropped while the
/// transaction is still open, including when a query panics.
struct TxConn(Option<OwnedMutexGuard<Connection>>);

impl TxConn {
    fn conn(&self) -> Result<&Connection, DbError> {
        self.0
            .as_deref()
            .ok_or_else(|| DbError::Internal("transaction already finished".into()))
    }

    fn finish(mut self, sql: &str) -> Result<(), DbError> {
        let conn = self
            .0
            .take()
            .ok_or_else(|| DbError::Internal("transaction already finished".into()))?;
        let result = conn.execute_batch(sql).to_db();
        if result.is_err() && !conn.is_autocommit() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!("rollback after failed {sql} also failed: {e}");
            }
        }
        result
    }
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("rollback of abandoned transaction failed: {e}");
                }
            }
        }
    }
}

/// A [`TaskRepository`] bound to one SQLite transaction.
///
/// Holds the database's connection lock for its whole lifetime, so any other
/// use of the same [`SqliteDatabase`](super::SqliteDatabase) waits until it
/// commits, rolls back or is dropped.
pub struct SqliteTransaction {
    slot: Mutex<Option<TxConn>>,
}

impl SqliteTransaction {
    pub(crate) fn begin(conn: OwnedMutexGuard<Connection>) -> Result<Self, DbError> {
        conn.execute_batch("BEGIN IMMEDIATE").to_db()?;
        Ok(Self {
            slot: Mutex::new(Some(TxConn(Some(conn)))),
        })
    }

    async fn run<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        let tx = slot
            .take()
            .ok_or_else(|| DbError::Internal("transaction is no longer usable".into()))?;
        let (tx, result) = tokio::task::spawn_blocking(move || {
            let result = match tx.conn() {
                Ok(conn) => f(conn),
                Err(e) => Err(e),
            };
            (tx, result)
        })
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;
        *slot = Some(tx);
        result
    }

    async fn finish(self, sql: &'static str) -> Result<(), DbError> {
        let tx = self
            .slot
            .into_inner()
            .ok_or_else(|| DbError::Internal("transaction is no longer usable".into()))?;
        tokio::task::spawn_blocking(move || tx.finish(sql))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn as_repository(&self) -> &dyn TaskRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.finish("ROLLBACK").await
    }
}

#[async_trait]
impl TaskRepository for SqliteTransaction {
    async fn create_task(&self, scope: &Scope, task: &Task) -> Result<Task, DbError> {
        let scope = scope.clone();
        let task = task.clone();
        self.run(move |conn| queries::tasks::create_task(conn, &scope, &task))
            .await
    }

    async fn update_task(&self, scope: &Scope, task: &Task) -> Result<(), DbError> {
        let scope = scope.clone();
        let task = task.clone();
        self.run(move |conn| queries::tasks::update_task(conn, &scope, &task))
            .await
    }

    async fn delete_task(&self, scope: &Scope, id: i64) -> Result<(), DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::delete_task(conn, &scope, id))
            .await
    }

    async fn get_task(&self, scope: &Scope, id: i64) -> Result<Option<Task>, DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::get_task(conn, &scope, id))
            .await
    }

    async fn get_active(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::get_active(conn, &scope, offset, limit))
            .await
    }

    async fn get_completed(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::get_completed(conn, &scope, offset, limit))
            .await
    }

    async fn get_expiring_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::get_expiring(conn, &scope, now, window))
            .await
    }

    async fn get_expired_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.run(move |conn| queries::tasks::get_expired(conn, &scope, now))
            .await
    }

    async fn purge_completed_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<i64>, DbError> {
        let scope = scope.clone();
        let cutoff = now - older_than;
        self.run(move |conn| queries::tasks::purge_completed(conn, &scope, cutoff))
            .await
    }

    async fn update_attachments(
        &self,
        task_id: i64,
        inserted: &[String],
        deleted: &[i64],
    ) -> Result<(), DbError> {
        let inserted = inserted.to_vec();
        let deleted = deleted.to_vec();
        self.run(move |conn| {
            queries::attachments::update_attachments(conn, task_id, &inserted, &deleted)
        })
        .await
    }
}
