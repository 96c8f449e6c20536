use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection};

use taskwatch_core::Attachment;

use super::super::pg_err;
use crate::DbError;

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: i64,
    task_id: i64,
    file_name: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<AttachmentRow> for Attachment {
    fn from(r: AttachmentRow) -> Self {
        Attachment {
            id: r.id,
            task_id: r.task_id,
            file_name: r.file_name,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

pub async fn list_attachments(
    conn: &mut PgConnection,
    task_id: i64,
) -> Result<Vec<Attachment>, DbError> {
    let rows = sqlx::query_as::<_, AttachmentRow>(
        "SELECT id, task_id, file_name, created_at, updated_at
         FROM attachments WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(pg_err)?;
    Ok(rows.into_iter().map(Attachment::from).collect())
}

/// Runs in its own transaction, which becomes a savepoint when `conn` is
/// already inside one.
pub async fn update_attachments(
    conn: &mut PgConnection,
    task_id: i64,
    inserted: &[String],
    deleted: &[i64],
) -> Result<(), DbError> {
    let now = Utc::now();
    let mut tx = conn.begin().await.map_err(pg_err)?;

    for name in inserted {
        sqlx::query("INSERT INTO attachments (task_id, file_name, created_at) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
    }
    if !deleted.is_empty() {
        sqlx::query("DELETE FROM attachments WHERE task_id = $1 AND id = ANY($2)")
            .bind(task_id)
            .bind(deleted)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
    }

    tx.commit().await.map_err(pg_err)
}
