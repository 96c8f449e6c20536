pub(crate) mod migrations;
pub mod queries;
mod tx;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use taskwatch_core::{Scope, Task};

use crate::{DbError, TaskRepository, Transaction, TxManager};

pub use tx::PostgresTransaction;

/// Map a sqlx::Error into a DbError::Internal.
pub(crate) fn pg_err(e: sqlx::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Create a DbError::NotFound with the given entity description.
pub(crate) fn pg_not_found(entity: &str) -> DbError {
    DbError::NotFound(entity.to_string())
}

#[derive(Clone)]
pub struct PostgresDatabase {
    pub(crate) pool: PgPool,
}

impl PostgresDatabase {
    /// Connect to a Postgres database and run migrations.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(pg_err)?;

        let db = Self { pool };
        migrations::run(&db.pool).await?;
        Ok(db)
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>, DbError> {
        self.pool.acquire().await.map_err(pg_err)
    }
}

#[async_trait]
impl TaskRepository for PostgresDatabase {
    async fn create_task(&self, scope: &Scope, task: &Task) -> Result<Task, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::create_task(&mut conn, scope, task).await
    }

    async fn update_task(&self, scope: &Scope, task: &Task) -> Result<(), DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::update_task(&mut conn, scope, task).await
    }

    async fn delete_task(&self, scope: &Scope, id: i64) -> Result<(), DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::delete_task(&mut conn, scope, id).await
    }

    async fn get_task(&self, scope: &Scope, id: i64) -> Result<Option<Task>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::get_task(&mut conn, scope, id).await
    }

    async fn get_active(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::get_active(&mut conn, scope, offset, limit).await
    }

    async fn get_completed(
        &self,
        scope: &Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Task>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::get_completed(&mut conn, scope, offset, limit).await
    }

    async fn get_expiring_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Task>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::get_expiring(&mut conn, scope, now, window).await
    }

    async fn get_expired_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::get_expired(&mut conn, scope, now).await
    }

    async fn purge_completed_at(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<Vec<i64>, DbError> {
        let mut conn = self.conn().await?;
        queries::tasks::purge_completed(&mut conn, scope, now - older_than).await
    }

    async fn update_attachments(
        &self,
        task_id: i64,
        inserted: &[String],
        deleted: &[i64],
    ) -> Result<(), DbError> {
        let mut conn = self.conn().await?;
        queries::attachments::update_attachments(&mut conn, task_id, inserted, deleted).await
    }
}

#[async_trait]
impl TxManager for PostgresDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let tx = self.pool.begin().await.map_err(pg_err)?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    /// Close the pool, waiting for checked-out connections to return.
    async fn close(&self) {
        self.pool.close().await;
    }
}
