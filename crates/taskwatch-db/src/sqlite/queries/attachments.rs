use chrono::Utc;
use rusqlite::{params, Connection, Row};
use tracing::warn;

use taskwatch_core::Attachment;

use super::super::SqliteResultExt;
use crate::DbError;

pub(crate) fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        file_name: row.get("file_name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn list_attachments(conn: &Connection, task_id: i64) -> Result<Vec<Attachment>, DbError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, file_name, created_at, updated_at
             FROM attachments WHERE task_id = ?1 ORDER BY id ASC",
        )
        .to_db()?;
    let attachments = stmt
        .query_map(params![task_id], row_to_attachment)
        .to_db()?
        .collect::<Result<Vec<_>, _>>()
        .to_db()?;
    Ok(attachments)
}

/// Applies inserts and deletes under a savepoint, so it is atomic on its own
/// and nests inside an already open transaction.
pub fn update_attachments(
    conn: &Connection,
    task_id: i64,
    inserted: &[String],
    deleted: &[i64],
) -> Result<(), DbError> {
    conn.execute_batch("SAVEPOINT update_attachments").to_db()?;
    match apply_attachments(conn, task_id, inserted, deleted) {
        Ok(()) => conn.execute_batch("RELEASE update_attachments").to_db(),
        Err(e) => {
            if let Err(rb) =
                conn.execute_batch("ROLLBACK TO update_attachments; RELEASE update_attachments")
            {
                warn!("rolling back attachments of task {task_id} failed: {rb}");
            }
            Err(e)
        }
    }
}

fn apply_attachments(
    conn: &Connection,
    task_id: i64,
    inserted: &[String],
    deleted: &[i64],
) -> Result<(), DbError> {
    let now = Utc::now();
    for name in inserted {
        conn.execute(
            "INSERT INTO attachments (task_id, file_name, created_at) VALUES (?1, ?2, ?3)",
            params![task_id, name, now],
        )
        .to_db()?;
    }
    for id in deleted {
        conn.execute(
            "DELETE FROM attachments WHERE id = ?1 AND task_id = ?2",
            params![id, task_id],
        )
        .to_db()?;
    }
    Ok(())
}
