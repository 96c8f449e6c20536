use rusqlite::Connection;

use super::SqliteResultExt;
use crate::DbError;

pub fn run(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .to_db()?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .to_db()?;

    if current_version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id          TEXT NOT NULL,
                 name             TEXT NOT NULL,
                 expires_at       TEXT,
                 expiring_info_at TEXT,
                 expired_info_at  TEXT,
                 created_at       TEXT NOT NULL,
                 updated_at       TEXT,
                 completed_at     TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);

             CREATE TABLE IF NOT EXISTS attachments (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 task_id    INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                 file_name  TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_attachments_task ON attachments(task_id);

             INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));",
        )
        .to_db()?;
    }

    if current_version < 2 {
        // Partial indexes backing the checker's sweeps.
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_tasks_open_expiry
                 ON tasks(expires_at) WHERE completed_at IS NULL;
             CREATE INDEX IF NOT EXISTS idx_tasks_completed
                 ON tasks(completed_at) WHERE completed_at IS NOT NULL;

             INSERT INTO schema_version (version, applied_at) VALUES (2, datetime('now'));",
        )
        .to_db()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_twice_records_each_version_once() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version ORDER BY version")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![1, 2]);
    }
}
