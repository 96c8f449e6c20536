// Integration tests that exercise every TaskRepository method against the
// in-memory SQLite backend.  The actual test logic lives in `common/mod.rs`
// so that the same assertions can be re-used for Postgres.

mod common;

use std::sync::Arc;
use taskwatch_db::Database;

async fn make_db() -> Arc<dyn Database> {
    Arc::new(taskwatch_db::SqliteDatabase::open_in_memory().unwrap())
}

#[tokio::test]
async fn task_crud() {
    let db = make_db().await;
    common::test_task_crud(&*db).await;
}

#[tokio::test]
async fn owner_scoping() {
    let db = make_db().await;
    common::test_owner_scoping(&*db).await;
}

#[tokio::test]
async fn active_and_completed_lists() {
    let db = make_db().await;
    common::test_active_and_completed_lists(&*db).await;
}

#[tokio::test]
async fn expiring_and_expired_selection() {
    let db = make_db().await;
    common::test_expiring_and_expired_selection(&*db).await;
}

#[tokio::test]
async fn marker_lifecycle() {
    let db = make_db().await;
    common::test_marker_lifecycle(&*db).await;
}

#[tokio::test]
async fn delete_completed_boundary() {
    let db = make_db().await;
    common::test_delete_completed_boundary(&*db).await;
}

#[tokio::test]
async fn update_attachments() {
    let db = make_db().await;
    common::test_update_attachments(&*db).await;
}

#[tokio::test]
async fn transact_commit_and_rollback() {
    let db = make_db().await;
    common::test_transact_commit_and_rollback(&*db).await;
}
