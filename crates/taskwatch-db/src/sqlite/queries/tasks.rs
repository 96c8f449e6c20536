use chrono::{DateTime, Duration, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};

use taskwatch_core::{Scope, Task};

use super::super::SqliteResultExt;
use super::attachments::list_attachments;
use crate::DbError;

const TASK_COLUMNS: &str = "id, user_id, name, expires_at, expiring_info_at, expired_info_at,
     created_at, updated_at, completed_at";

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        expires_at: row.get("expires_at")?,
        expiring_info_at: row.get("expiring_info_at")?,
        expired_info_at: row.get("expired_info_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        completed_at: row.get("completed_at")?,
        attachments: Vec::new(),
    })
}

/// Append an owner filter for `scope` to `sql`.
fn push_scope(sql: &mut String, param_values: &mut Vec<Box<dyn ToSql>>, scope: &Scope) {
    if let Scope::User(user_id) = scope {
        param_values.push(Box::new(user_id.clone()));
        sql.push_str(&format!(" AND user_id = ?{}", param_values.len()));
    }
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    param_values: &[Box<dyn ToSql>],
) -> Result<Vec<Task>, DbError> {
    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(sql).to_db()?;
    let mut tasks = stmt
        .query_map(params_ref.as_slice(), row_to_task)
        .to_db()?
        .collect::<Result<Vec<_>, _>>()
        .to_db()?;
    for task in &mut tasks {
        task.attachments = list_attachments(conn, task.id)?;
    }
    Ok(tasks)
}

pub fn create_task(conn: &Connection, scope: &Scope, task: &Task) -> Result<Task, DbError> {
    let user_id = scope
        .user_id()
        .ok_or_else(|| DbError::InvalidInput("creating a task requires a user scope".into()))?;
    task.validate()?;

    conn.execute(
        "INSERT INTO tasks (
             user_id, name, expires_at, expiring_info_at, expired_info_at,
             created_at, updated_at, completed_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            task.name,
            task.expires_at,
            task.expiring_info_at,
            task.expired_info_at,
            task.created_at,
            task.updated_at,
            task.completed_at,
        ],
    )
    .to_db()?;

    let id = conn.last_insert_rowid();
    get_task(conn, scope, id)?.ok_or_else(|| DbError::Internal(format!("task {id} vanished")))
}

pub fn update_task(conn: &Connection, scope: &Scope, task: &Task) -> Result<(), DbError> {
    task.validate()?;
    let mut sql = String::from(
        "UPDATE tasks SET name = ?1, expires_at = ?2, expiring_info_at = ?3,
             expired_info_at = ?4, updated_at = ?5, completed_at = ?6
         WHERE id = ?7",
    );
    let mut param_values: Vec<Box<dyn ToSql>> = vec![
        Box::new(task.name.clone()),
        Box::new(task.expires_at),
        Box::new(task.expiring_info_at),
        Box::new(task.expired_info_at),
        Box::new(task.updated_at),
        Box::new(task.completed_at),
        Box::new(task.id),
    ];
    push_scope(&mut sql, &mut param_values, scope);

    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
    let changed = conn.execute(&sql, params_ref.as_slice()).to_db()?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("task {}", task.id)));
    }
    Ok(())
}

pub fn delete_task(conn: &Connection, scope: &Scope, id: i64) -> Result<(), DbError> {
    let mut sql = String::from("DELETE FROM tasks WHERE id = ?1");
    let mut param_values: Vec<Box<dyn ToSql>> = vec![Box::new(id)];
    push_scope(&mut sql, &mut param_values, scope);

    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
    let changed = conn.execute(&sql, params_ref.as_slice()).to_db()?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("task {id}")));
    }
    Ok(())
}

pub fn get_task(conn: &Connection, scope: &Scope, id: i64) -> Result<Option<Task>, DbError> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let mut param_values: Vec<Box<dyn ToSql>> = vec![Box::new(id)];
    push_scope(&mut sql, &mut param_values, scope);

    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
    let task = conn
        .query_row(&sql, params_ref.as_slice(), row_to_task)
        .optional()
        .to_db()?;
    match task {
        Some(mut task) => {
            task.attachments = list_attachments(conn, task.id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

pub fn get_active(
    conn: &Connection,
    scope: &Scope,
    offset: i64,
    limit: i64,
) -> Result<Vec<Task>, DbError> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE completed_at IS NULL");
    let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
    push_scope(&mut sql, &mut param_values, scope);
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    sql.push_str(&format!(
        " ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
        param_values.len() - 1,
        param_values.len()
    ));
    query_tasks(conn, &sql, &param_values)
}

pub fn get_completed(
    conn: &Connection,
    scope: &Scope,
    offset: i64,
    limit: i64,
) -> Result<Vec<Task>, DbError> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE completed_at IS NOT NULL");
    let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
    push_scope(&mut sql, &mut param_values, scope);
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    sql.push_str(&format!(
        " ORDER BY completed_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
        param_values.len() - 1,
        param_values.len()
    ));
    query_tasks(conn, &sql, &param_values)
}

pub fn get_expiring(
    conn: &Connection,
    scope: &Scope,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<Task>, DbError> {
    let mut sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NULL
           AND expiring_info_at IS NULL
           AND expires_at IS NOT NULL
           AND expires_at >= ?1
           AND expires_at < ?2"
    );
    let mut param_values: Vec<Box<dyn ToSql>> = vec![Box::new(now), Box::new(now + window)];
    push_scope(&mut sql, &mut param_values, scope);
    sql.push_str(" ORDER BY created_at ASC, id ASC");
    query_tasks(conn, &sql, &param_values)
}

pub fn get_expired(
    conn: &Connection,
    scope: &Scope,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, DbError> {
    let mut sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE completed_at IS NULL
           AND expired_info_at IS NULL
           AND expires_at IS NOT NULL
           AND expires_at < ?1"
    );
    let mut param_values: Vec<Box<dyn ToSql>> = vec![Box::new(now)];
    push_scope(&mut sql, &mut param_values, scope);
    sql.push_str(" ORDER BY created_at ASC, id ASC");
    query_tasks(conn, &sql, &param_values)
}

/// Delete tasks completed strictly before `cutoff`. Attachment rows cascade.
pub fn purge_completed(
    conn: &Connection,
    scope: &Scope,
    cutoff: DateTime<Utc>,
) -> Result<Vec<i64>, DbError> {
    let mut sql = String::from(
        "DELETE FROM tasks WHERE completed_at IS NOT NULL AND completed_at < ?1",
    );
    let mut param_values: Vec<Box<dyn ToSql>> = vec![Box::new(cutoff)];
    push_scope(&mut sql, &mut param_values, scope);
    sql.push_str(" RETURNING id");

    let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql).to_db()?;
    let mut ids = stmt
        .query_map(params_ref.as_slice(), |row| row.get::<_, i64>(0))
        .to_db()?
        .collect::<Result<Vec<_>, _>>()
        .to_db()?;
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        migrations::run(&conn).unwrap();
        conn
    }

    fn user() -> Scope {
        Scope::user("alice")
    }

    #[test]
    fn test_task_crud() {
        let conn = setup();
        let expires = Utc::now() + Duration::hours(2);

        let task = create_task(&conn, &user(), &Task::new("First task", Some(expires))).unwrap();
        assert!(task.id > 0);
        assert_eq!(task.user_id, "alice");
        assert_eq!(task.expires_at, Some(expires));

        let mut fetched = get_task(&conn, &user(), task.id).unwrap().unwrap();
        assert_eq!(fetched.name, "First task");

        fetched.update("Renamed", None);
        update_task(&conn, &user(), &fetched).unwrap();
        let fetched = get_task(&conn, &user(), task.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Renamed");
        assert!(fetched.expires_at.is_none());

        delete_task(&conn, &user(), task.id).unwrap();
        assert!(get_task(&conn, &user(), task.id).unwrap().is_none());
    }

    #[test]
    fn create_requires_user_scope() {
        let conn = setup();
        let err = create_task(&conn, &Scope::System, &Task::new("x", None)).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[test]
    fn create_rejects_invalid_name() {
        let conn = setup();
        let err = create_task(&conn, &user(), &Task::new("", None)).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
    }

    #[test]
    fn other_users_cannot_see_or_touch_task() {
        let conn = setup();
        let task = create_task(&conn, &user(), &Task::new("mine", None)).unwrap();
        let bob = Scope::user("bob");

        assert!(get_task(&conn, &bob, task.id).unwrap().is_none());
        assert!(matches!(
            delete_task(&conn, &bob, task.id),
            Err(DbError::NotFound(_))
        ));
        assert!(matches!(
            update_task(&conn, &bob, &task),
            Err(DbError::NotFound(_))
        ));
        // System scope bypasses ownership.
        assert!(get_task(&conn, &Scope::System, task.id).unwrap().is_some());
    }

    #[test]
    fn active_and_completed_are_disjoint_and_paginated() {
        let conn = setup();
        let now = Utc::now();
        for i in 0..3 {
            let mut t = Task::new(format!("open {i}"), None);
            t.created_at = now + Duration::seconds(i);
            create_task(&conn, &user(), &t).unwrap();
        }
        let mut done = Task::new("done", None);
        done.set_completed(now);
        create_task(&conn, &user(), &done).unwrap();

        let active = get_active(&conn, &user(), 0, 10).unwrap();
        let names: Vec<_> = active.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["open 2", "open 1", "open 0"]);

        let page = get_active(&conn, &user(), 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "open 1");

        let completed = get_completed(&conn, &user(), 0, 10).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "done");
    }

    #[test]
    fn expiring_respects_window_and_markers() {
        let conn = setup();
        let now = Utc::now();
        let window = Duration::hours(24);

        let soon = create_task(&conn, &user(), &Task::new("soon", Some(now + Duration::hours(1))))
            .unwrap();
        create_task(&conn, &user(), &Task::new("later", Some(now + Duration::hours(48)))).unwrap();
        create_task(&conn, &user(), &Task::new("past", Some(now - Duration::hours(1)))).unwrap();
        create_task(&conn, &user(), &Task::new("never", None)).unwrap();
        let mut notified = Task::new("notified", Some(now + Duration::hours(2)));
        notified.set_expiring_info_at(now);
        create_task(&conn, &user(), &notified).unwrap();
        let mut done = Task::new("done", Some(now + Duration::hours(2)));
        done.set_completed(now);
        create_task(&conn, &user(), &done).unwrap();

        let expiring = get_expiring(&conn, &Scope::System, now, window).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);
    }

    #[test]
    fn expiring_upper_bound_is_exclusive() {
        let conn = setup();
        let now = Utc::now();
        let window = Duration::hours(24);
        create_task(&conn, &user(), &Task::new("edge", Some(now + window))).unwrap();
        assert!(get_expiring(&conn, &Scope::System, now, window)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn expired_skips_completed_and_notified() {
        let conn = setup();
        let now = Utc::now();

        let mut first = Task::new("first", Some(now - Duration::hours(2)));
        first.created_at = now - Duration::hours(3);
        let first = create_task(&conn, &user(), &first).unwrap();
        let second = create_task(&conn, &user(), &Task::new("second", Some(now - Duration::hours(1))))
            .unwrap();
        let mut done = Task::new("done", Some(now - Duration::hours(1)));
        done.set_completed(now);
        create_task(&conn, &user(), &done).unwrap();
        let mut notified = Task::new("notified", Some(now - Duration::hours(1)));
        notified.set_expired_info_at(now);
        create_task(&conn, &user(), &notified).unwrap();

        let expired = get_expired(&conn, &Scope::System, now).unwrap();
        let ids: Vec<_> = expired.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn purge_completed_boundary() {
        let conn = setup();
        let now = Utc::now();
        let window = Duration::hours(48);

        let mut old = Task::new("old", None);
        old.set_completed(now - window - Duration::seconds(1));
        let old = create_task(&conn, &user(), &old).unwrap();

        let mut recent = Task::new("recent", None);
        recent.set_completed(now - window + Duration::seconds(1));
        let recent = create_task(&conn, &user(), &recent).unwrap();

        create_task(&conn, &user(), &Task::new("open", None)).unwrap();

        let deleted = purge_completed(&conn, &Scope::System, now - window).unwrap();
        assert_eq!(deleted, vec![old.id]);
        assert!(get_task(&conn, &Scope::System, recent.id).unwrap().is_some());

        let deleted = purge_completed(&conn, &Scope::System, now - window).unwrap();
        assert!(deleted.is_empty());
    }

    #[test]
    fn deleting_a_task_cascades_attachment_rows() {
        let conn = setup();
        let task = create_task(&conn, &user(), &Task::new("t", None)).unwrap();
        super::super::attachments::update_attachments(&conn, task.id, &["a".into()], &[])
            .unwrap();
        assert_eq!(
            get_task(&conn, &user(), task.id).unwrap().unwrap().attachments.len(),
            1
        );

        delete_task(&conn, &user(), task.id).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM attachments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
