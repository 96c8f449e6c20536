pub(crate) mod migrations;
pub mod queries;
mod tx;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use taskwatch_core::{Scope, Task};

use crate::{DbConfig, DbError, TaskRepository, Transaction, TxManager};

pub use tx::SqliteTransaction;

/// Extension trait that converts `rusqlite::Result<T>` into `Result<T, DbError>`.
pub(crate) trait SqliteResultExt<T> {
    fn to_db(self) -> Result<T, DbError>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn to_db(self) -> Result<T, DbError> {
        self.map_err(map_sqlite_err)
    }
}

/// SQLite-backed task store.
///
/// A single connection is shared behind an async mutex; queries run on the
/// blocking pool while holding it. An open [`SqliteTransaction`] holds the
/// same mutex until it commits or rolls back.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(config: &DbConfig) -> Result<Self, DbError> {
        let path = config
            .sqlite_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::data_dir().join("taskwatch.db"));
        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).to_db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .to_db()?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().to_db()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").to_db()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        migrations::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool with exclusive access to the connection.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&*conn))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
}

/// Map a `rusqlite::Error` into a `DbError::Internal`.
pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> DbError {
    DbError::Internal(e.to_string())
}

#[async_trait]
impl TaskRepository for SqliteDatabase {
    async fn create_task(&self, scope: &Scope, task: &Task) -> Result<Task, DbError> {
        let scope = scope.clone();
        let task = task.clone();
        self.with_conn(move |conn| queries::tasks::create_task(conn, &scope, &task))
            .await
    }

    async fn update_task(&self, scope: &Scope, task: &Task) -> Result<(), DbError> {
        let scope = scope.clone();
        let task = task.clone();
        self.with_conn(move |conn| queries::tasks::update_task(conn, &scope, &task))
            .await
    }

    async fn delete_task(&self, scope: &Scope, id: i64) -> Result<(), DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::delete_task(conn, &scope, id))
            .await
    }

    async fn get_task(&self, scope: &Scope, id: i64) -> Result<Option<Task>, DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::get_task(conn, &scope, id))
            .await
    }

    async fn get_active(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::get_active(conn, &scope, offset, limit))
            .await
    }

    async fn get_completed(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::get_completed(conn, &scope, offset, limit))
            .await
    }

    async fn get_expiring_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::get_expiring(conn, &scope, now, window))
            .await
    }

    async fn get_expired_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let scope = scope.clone();
        self.with_conn(move |conn| queries::tasks::get_expired(conn, &scope, now))
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
        self.with_conn(move |conn| queries::tasks::purge_completed(conn, &scope, cutoff))
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
        self.with_conn(move |conn| {
            queries::attachments::update_attachments(conn, task_id, &inserted, &deleted)
        })
        .await
    }
}

#[async_trait]
impl TxManager for SqliteDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let conn = self.conn.clone().lock_owned().await;
        let tx = SqliteTransaction::begin(conn)?;
        Ok(Box::new(tx))
    }
}
