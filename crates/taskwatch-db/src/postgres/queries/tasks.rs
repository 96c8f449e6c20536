//! Owner scoping binds the user id as a nullable parameter, so
//! `($n::text IS NULL OR user_id = $n)` matches every row for the system scope.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;

use taskwatch_core::{Scope, Task};

use super::super::{pg_err, pg_not_found};
use super::attachments::list_attachments;
use crate::DbError;

const TASK_COLUMNS: &str = "id, user_id, name, expires_at, expiring_info_at, expired_info_at,
     created_at, updated_at, completed_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    user_id: String,
    name: String,
    expires_at: Option<DateTime<Utc>>,
    expiring_info_at: Option<DateTime<Utc>>,
    expired_info_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Task {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            expires_at: r.expires_at,
            expiring_info_at: r.expiring_info_at,
            expired_info_at: r.expired_info_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
            attachments: Vec::new(),
        }
    }
}

async fn hydrate(conn: &mut PgConnection, rows: Vec<TaskRow>) -> Result<Vec<Task>, DbError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let mut task = Task::from(row);
        task.attachments = list_attachments(conn, task.id).await?;
        tasks.push(task);
    }
    Ok(tasks)
}

pub async fn create_task(
    conn: &mut PgConnection,
    scope: &Scope,
    task: &Task,
) -> Result<Task, DbError> {
    let user_id = scope
        .user_id()
        .ok_or_else(|| DbError::InvalidInput("creating a task requires a user scope".into()))?;
    task.validate()?;

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO tasks (
             user_id, name, expires_at, expiring_info_at, expired_info_at,
             created_at, updated_at, completed_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id",
    )
    .bind(user_id)
    .bind(&task.name)
    .bind(task.expires_at)
    .bind(task.expiring_info_at)
    .bind(task.expired_info_at)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(pg_err)?;

    get_task(conn, scope, id)
        .await?
        .ok_or_else(|| DbError::Internal(format!("task {id} vanished")))
}

pub async fn update_task(
    conn: &mut PgConnection,
    scope: &Scope,
    task: &Task,
) -> Result<(), DbError> {
    task.validate()?;
    let result = sqlx::query(
        "UPDATE tasks SET name = $1, expires_at = $2, expiring_info_at = $3,
             expired_info_at = $4, updated_at = $5, completed_at = $6
         WHERE id = $7 AND ($8::text IS NULL OR user_id = $8)",
    )
    .bind(&task.name)
    .bind(task.expires_at)
    .bind(task.expiring_info_at)
    .bind(task.expired_info_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(task.id)
    .bind(scope.user_id())
    .execute(&mut *conn)
    .await
    .map_err(pg_err)?;

    if result.rows_affected() == 0 {
        return Err(pg_not_found(&format!("task {}", task.id)));
    }
    Ok(())
}

pub async fn delete_task(conn: &mut PgConnection, scope: &Scope, id: i64) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND ($2::text IS NULL OR user_id = $2)")
        .bind(id)
        .bind(scope.user_id())
        .execute(&mut *conn)
        .await
        .map_err(pg_err)?;

    if result.rows_affected() == 0 {
        return Err(pg_not_found(&format!("task {id}")));
    }
    Ok(())
}

pub async fn get_task(
    conn: &mut PgConnection,
    scope: &Scope,
    id: i64,
) -> Result<Option<Task>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND ($2::text IS NULL OR user_id = $2)"
    );
    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .bind(scope.user_id())
        .fetch_optional(&mut *conn)
        .await
        .map_err(pg_err)?;

    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

pub async fn get_active(
    conn: &mut PgConnection,
    scope: &Scope,
    offset: i64,
    limit: i64,
) -> Result<Vec<Task>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NULL AND ($1::text IS NULL OR user_id = $1)
         ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(scope.user_id())
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(pg_err)?;
    hydrate(conn, rows).await
}

pub async fn get_completed(
    conn: &mut PgConnection,
    scope: &Scope,
    offset: i64,
    limit: i64,
) -> Result<Vec<Task>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NOT NULL AND ($1::text IS NULL OR user_id = $1)
         ORDER BY completed_at DESC, id DESC LIMIT $2 OFFSET $3"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(scope.user_id())
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(pg_err)?;
    hydrate(conn, rows).await
}

pub async fn get_expiring(
    conn: &mut PgConnection,
    scope: &Scope,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<Task>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NULL
           AND expiring_info_at IS NULL
           AND expires_at IS NOT NULL
           AND expires_at >= $1
           AND expires_at < $2
           AND ($3::text IS NULL OR user_id = $3)
         ORDER BY created_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(now)
        .bind(now + window)
        .bind(scope.user_id())
        .fetch_all(&mut *conn)
        .await
        .map_err(pg_err)?;
    hydrate(conn, rows).await
}

pub async fn get_expired(
    conn: &mut PgConnection,
    scope: &Scope,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, DbError> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NULL
           AND expired_info_at IS NULL
           AND expires_at IS NOT NULL
           AND expires_at < $1
           AND ($2::text IS NULL OR user_id = $2)
         ORDER BY created_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(now)
        .bind(scope.user_id())
        .fetch_all(&mut *conn)
        .await
        .map_err(pg_err)?;
    hydrate(conn, rows).await
}

pub async fn purge_completed(
    conn: &mut PgConnection,
    scope: &Scope,
    cutoff: DateTime<Utc>,
) -> Result<Vec<i64>, DbError> {
    let mut ids: Vec<i64> = sqlx::query_scalar(
        "DELETE FROM tasks
         WHERE completed_at IS NOT NULL AND completed_at < $1
           AND ($2::text IS NULL OR user_id = $2)
         RETURNING id",
    )
    .bind(cutoff)
    .bind(scope.user_id())
    .fetch_all(&mut *conn)
    .await
    .map_err(pg_err)?;
    ids.sort_unstable();
    Ok(ids)
}
