#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod tx;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use taskwatch_core::{CoreError, Scope, Task};

#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;
pub use tx::{transact, Transaction, TxManager};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The unit of work failed and so did the rollback that followed.
    #[error("{source}; rollback also failed: {rollback}")]
    Rollback {
        source: Box<DbError>,
        rollback: Box<DbError>,
    },
}

impl From<CoreError> for DbError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(m) => DbError::NotFound(m),
            CoreError::InvalidInput(m) => DbError::InvalidInput(m),
        }
    }
}

/// Relational persistence for tasks and their attachment metadata.
///
/// Every operation that takes a [`Scope`] is restricted to that user's rows
/// when the scope is [`Scope::User`]; [`Scope::System`] sees all rows.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert `task` owned by the scoped user. Requires [`Scope::User`].
    async fn create_task(&self, scope: &Scope, task: &Task) -> Result<Task, DbError>;

    /// Persist name, expiry, markers and completion of an existing task.
    async fn update_task(&self, scope: &Scope, task: &Task) -> Result<(), DbError>;

    async fn delete_task(&self, scope: &Scope, id: i64) -> Result<(), DbError>;

    /// `Ok(None)` when the task does not exist or is not visible to `scope`.
    async fn get_task(&self, scope: &Scope, id: i64) -> Result<Option<Task>, DbError>;

    async fn get_active(&self, scope: &Scope, offset: i64, limit: i64)
        -> Result<Vec<Task>, DbError>;

    async fn get_completed(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError>;

    /// Tasks with `expires_at` in `[now, now + window)` that have not been
    /// notified as expiring and are not completed, oldest first.
    async fn get_expiring_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Task>, DbError>;

    async fn get_expiring(&self, scope: &Scope, window: Duration) -> Result<Vec<Task>, DbError> {
        self.get_expiring_at(scope, Utc::now(), window).await
    }

    /// Tasks with `expires_at` before `now` that have not been notified as
    /// expired and are not completed, oldest first.
    async fn get_expired_at(&self, scope: &Scope, now: DateTime<Utc>)
        -> Result<Vec<Task>, DbError>;

    async fn get_expired(&self, scope: &Scope) -> Result<Vec<Task>, DbError> {
        self.get_expired_at(scope, Utc::now()).await
    }

    /// Delete tasks completed before `now - older_than`, returning their ids.
    async fn purge_completed_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<i64>, DbError>;

    async fn purge_completed(
        &self,
        scope: &Scope,
        older_than: Duration,
    ) -> Result<Vec<i64>, DbError> {
        self.purge_completed_at(scope, Utc::now(), older_than).await
    }

    async fn delete_completed(&self, scope: &Scope, older_than: Duration) -> Result<u64, DbError> {
        Ok(self.purge_completed(scope, older_than).await?.len() as u64)
    }

    /// Insert rows for `inserted` names and remove the `deleted` attachment
    /// ids in a single local transaction.
    async fn update_attachments(
        &self,
        task_id: i64,
        inserted: &[String],
        deleted: &[i64],
    ) -> Result<(), DbError>;
}

/// A task store that can also open transactions.
pub trait Database: TaskRepository + TxManager {}

impl<T: TaskRepository + TxManager + ?Sized> Database for T {}

/// Which backend to open.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Postgres connection URL. Takes precedence when set.
    pub database_url: Option<String>,
    /// SQLite file path; defaults to `<data_dir>/taskwatch.db`.
    pub sqlite_path: Option<String>,
}

pub async fn open_database(config: &DbConfig) -> Result<Arc<dyn Database>, DbError> {
    if let Some(url) = &config.database_url {
        #[cfg(feature = "postgres")]
        {
            let db = PostgresDatabase::connect(url).await?;
            return Ok(Arc::new(db));
        }
        #[cfg(not(feature = "postgres"))]
        {
            let _ = url;
            return Err(DbError::InvalidInput(
                "a database URL was given but the 'postgres' feature is not enabled".into(),
            ));
        }
    }

    #[cfg(feature = "sqlite")]
    {
        let db = SqliteDatabase::open(config)?;
        Ok(Arc::new(db))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Err(DbError::InvalidInput(
            "no database URL given and the 'sqlite' feature is not enabled".into(),
        ))
    }
}

/// `$XDG_DATA_HOME/taskwatch`, falling back to `~/.local/share/taskwatch`.
pub fn data_dir() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from(".")
    };
    base.join("taskwatch")
}
