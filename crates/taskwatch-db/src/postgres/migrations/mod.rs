use sqlx::PgPool;

use crate::DbError;

/// Fixed key for the advisory lock that serialises migration runs.
const MIGRATION_LOCK_KEY: i64 = 0x7461_736B_7761_7463; // "taskwatc"

pub async fn run(pool: &PgPool) -> Result<(), DbError> {
    // Session-level lock: take a dedicated connection so lock and unlock
    // run on the same session.
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    let result = run_inner(&mut conn).await;

    // Always release the advisory lock, even on error.
    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await;

    result
}

async fn run_inner(conn: &mut sqlx::PgConnection) -> Result<(), DbError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| DbError::Internal(e.to_string()))?;

    let current: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| DbError::Internal(e.to_string()))?;

    if current < 1 {
        sqlx::raw_sql(include_str!("sql/V1__initial.sql"))
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?;
    }

    if current < 2 {
        sqlx::raw_sql(include_str!("sql/V2__sweep_indexes.sql"))
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?;
    }

    Ok(())
}
