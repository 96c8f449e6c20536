// Backend-agnostic integration tests for the TaskRepository and TxManager traits.
//
// Each public async function accepts `&dyn Database` so that the same logic
// can be exercised against both the SQLite and Postgres backends.

use chrono::{Duration, Utc};
use taskwatch_core::{reconcile_attachments, Scope, Task};
use taskwatch_db::{transact, Database, DbError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn alice() -> Scope {
    Scope::user("alice")
}

fn bob() -> Scope {
    Scope::user("bob")
}

async fn create(db: &dyn Database, scope: &Scope, task: Task) -> Task {
    db.create_task(scope, &task).await.unwrap()
}

// ---------------------------------------------------------------------------
// Task tests
// ---------------------------------------------------------------------------

/// Create, read, update and delete a single task.
pub async fn test_task_crud(db: &dyn Database) {
    let expires = Utc::now() + Duration::hours(5);
    let task = create(db, &alice(), Task::new("Pay rent", Some(expires))).await;
    assert!(task.id > 0);
    assert_eq!(task.user_id, "alice");
    assert!(task.attachments.is_empty());

    let mut fetched = db.get_task(&alice(), task.id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "Pay rent");
    assert!(fetched.expires_at.is_some());

    fetched.update("Pay rent and bills", None);
    db.update_task(&alice(), &fetched).await.unwrap();
    let fetched = db.get_task(&alice(), task.id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "Pay rent and bills");
    assert!(fetched.expires_at.is_none());
    assert!(fetched.updated_at.is_some());

    db.delete_task(&alice(), task.id).await.unwrap();
    assert!(db.get_task(&alice(), task.id).await.unwrap().is_none());
    assert!(matches!(
        db.delete_task(&alice(), task.id).await,
        Err(DbError::NotFound(_))
    ));
}

/// User scopes only see their own tasks; the system scope sees all.
pub async fn test_owner_scoping(db: &dyn Database) {
    let task = create(db, &alice(), Task::new("private", None)).await;
    create(db, &bob(), Task::new("bob's", None)).await;

    assert!(db.get_task(&bob(), task.id).await.unwrap().is_none());
    assert!(db.get_task(&Scope::System, task.id).await.unwrap().is_some());

    let mine = db.get_active(&alice(), 0, 100).await.unwrap();
    assert_eq!(mine.len(), 1);
    let all = db.get_active(&Scope::System, 0, 100).await.unwrap();
    assert_eq!(all.len(), 2);

    assert!(matches!(
        db.create_task(&Scope::System, &Task::new("orphan", None)).await,
        Err(DbError::InvalidInput(_))
    ));
}

/// Active and completed lists are disjoint, ordered and paginated.
pub async fn test_active_and_completed_lists(db: &dyn Database) {
    let base = Utc::now() - Duration::hours(1);
    for i in 0..4 {
        let mut t = Task::new(format!("open {i}"), None);
        t.created_at = base + Duration::minutes(i);
        create(db, &alice(), t).await;
    }
    for i in 0..2 {
        let mut t = Task::new(format!("done {i}"), None);
        t.set_completed(base + Duration::minutes(i));
        create(db, &alice(), t).await;
    }

    let first = db.get_active(&alice(), 0, 2).await.unwrap();
    let names: Vec<_> = first.iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["open 3", "open 2"]);
    let second = db.get_active(&alice(), 2, 2).await.unwrap();
    let names: Vec<_> = second.iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["open 1", "open 0"]);

    let completed = db.get_completed(&alice(), 0, 10).await.unwrap();
    let names: Vec<_> = completed.iter().map(|t| t.name.clone()).collect();
    assert_eq!(names, vec!["done 1", "done 0"]);
}

/// The expiring and expired sweeps pick exactly the unnotified, open tasks.
pub async fn test_expiring_and_expired_selection(db: &dyn Database) {
    let now = Utc::now();
    let window = Duration::hours(24);

    let soon = create(db, &alice(), Task::new("soon", Some(now + Duration::hours(1)))).await;
    let far = create(db, &alice(), Task::new("far", Some(now + Duration::days(3)))).await;
    let past = create(db, &alice(), Task::new("past", Some(now - Duration::hours(1)))).await;
    let mut done = Task::new("done", Some(now - Duration::hours(1)));
    done.set_completed(now);
    create(db, &alice(), done).await;

    let expiring = db.get_expiring(&Scope::System, window).await.unwrap();
    assert_eq!(expiring.iter().map(|t| t.id).collect::<Vec<_>>(), vec![soon.id]);

    let expired = db.get_expired(&Scope::System).await.unwrap();
    assert_eq!(expired.iter().map(|t| t.id).collect::<Vec<_>>(), vec![past.id]);

    // Two and a half days on, "far" is due and "soon" has lapsed.
    let later = now + Duration::hours(60);
    let expiring = db.get_expiring_at(&Scope::System, later, window).await.unwrap();
    assert_eq!(expiring.iter().map(|t| t.id).collect::<Vec<_>>(), vec![far.id]);
    let expired = db.get_expired_at(&Scope::System, later).await.unwrap();
    assert_eq!(
        expired.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![soon.id, past.id]
    );
}

/// Once the marker is persisted the task drops out of the sweep, and an
/// update restarts the lifecycle.
pub async fn test_marker_lifecycle(db: &dyn Database) {
    let window = Duration::hours(24);
    let expires = Utc::now() + Duration::hours(1);
    let task = create(db, &alice(), Task::new("soon", Some(expires))).await;

    let mut selected = db.get_expiring(&Scope::System, window).await.unwrap();
    assert_eq!(selected.len(), 1);
    let mut marked = selected.remove(0);
    marked.set_expiring_info_at(Utc::now());
    db.update_task(&Scope::System, &marked).await.unwrap();

    assert!(db.get_expiring(&Scope::System, window).await.unwrap().is_empty());

    let mut edited = db.get_task(&alice(), task.id).await.unwrap().unwrap();
    edited.update("soon, renamed", Some(expires));
    db.update_task(&alice(), &edited).await.unwrap();
    assert_eq!(db.get_expiring(&Scope::System, window).await.unwrap().len(), 1);
}

/// Completed tasks older than the window are deleted, newer ones kept.
pub async fn test_delete_completed_boundary(db: &dyn Database) {
    let window = Duration::hours(48);
    let now = Utc::now();

    let mut old = Task::new("old", None);
    old.set_completed(now - window - Duration::seconds(1));
    let old = create(db, &alice(), old).await;
    let mut recent = Task::new("recent", None);
    recent.set_completed(now - window + Duration::seconds(5));
    let recent = create(db, &alice(), recent).await;

    assert_eq!(db.delete_completed(&Scope::System, window).await.unwrap(), 1);
    assert!(db.get_task(&alice(), old.id).await.unwrap().is_none());
    assert!(db.get_task(&alice(), recent.id).await.unwrap().is_some());

    assert_eq!(db.delete_completed(&Scope::System, window).await.unwrap(), 0);
}

/// Attachment rows follow the reconciled insert/delete sets.
pub async fn test_update_attachments(db: &dyn Database) {
    let task = create(db, &alice(), Task::new("with files", None)).await;
    db.update_attachments(task.id, &["a.pdf".into(), "b.pdf".into()], &[])
        .await
        .unwrap();

    let current = db.get_task(&alice(), task.id).await.unwrap().unwrap();
    assert_eq!(current.attachments.len(), 2);

    let update = reconcile_attachments(&current.attachments, &["b.pdf".into(), "c.pdf".into()]);
    db.update_attachments(task.id, &update.inserted, &update.deleted_ids())
        .await
        .unwrap();

    let names: Vec<_> = db
        .get_task(&alice(), task.id)
        .await
        .unwrap()
        .unwrap()
        .attachments
        .into_iter()
        .map(|a| a.file_name)
        .collect();
    assert_eq!(names, vec!["b.pdf", "c.pdf"]);
}

// ---------------------------------------------------------------------------
// Transaction tests
// ---------------------------------------------------------------------------

/// `transact` commits on success and rolls back every write on failure.
pub async fn test_transact_commit_and_rollback(db: &dyn Database) {
    let task = create(db, &alice(), Task::new("tx", None)).await;
    let id = task.id;

    let scope = alice();
    transact(db, move |repo| {
        Box::pin(async move {
            let mut task = repo
                .get_task(&scope, id)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("task {id}")))?;
            task.update("tx committed", None);
            repo.update_task(&scope, &task).await?;
            repo.update_attachments(id, &["kept.txt".to_string()], &[]).await
        })
    })
    .await
    .unwrap();

    let stored = db.get_task(&alice(), id).await.unwrap().unwrap();
    assert_eq!(stored.name, "tx committed");
    assert_eq!(stored.attachments.len(), 1);

    let scope = alice();
    let err = transact(db, move |repo| {
        Box::pin(async move {
            repo.update_attachments(id, &["dropped.txt".to_string()], &[])
                .await?;
            repo.delete_task(&scope, id).await?;
            Err::<(), _>(DbError::InvalidInput("blob write failed".into()))
        })
    })
    .await
    .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput(_)));

    let stored = db.get_task(&alice(), id).await.unwrap().unwrap();
    assert_eq!(stored.name, "tx committed");
    assert_eq!(stored.attachments.len(), 1);
}
