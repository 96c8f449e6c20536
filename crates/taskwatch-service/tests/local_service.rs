use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use taskwatch_db::{Database, SqliteDatabase};
use taskwatch_service::{CreateTask, LocalService, ServiceError, TaskService, UpdateTask};
use taskwatch_store::{AttachmentFile, AttachmentStore, LocalStore, StoreConfig};

struct Fixture {
    service: LocalService,
    attachments: AttachmentStore,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
    let blobs = LocalStore::new(&StoreConfig {
        local_data_dir: Some(dir.path().to_string_lossy().to_string()),
        ..StoreConfig::default()
    });
    let attachments = AttachmentStore::new(Arc::new(blobs));
    Fixture {
        service: LocalService::new(db, attachments.clone()),
        attachments,
        _dir: dir,
    }
}

fn create(name: &str, files: &[(&str, &str)]) -> CreateTask {
    CreateTask {
        name: name.into(),
        expires_at: Some(Utc::now() + Duration::days(2)),
        files: files
            .iter()
            .map(|(n, c)| AttachmentFile::new(*n, c.to_string()))
            .collect(),
    }
}

fn names(task: &taskwatch_core::Task) -> Vec<String> {
    task.attachments.iter().map(|a| a.file_name.clone()).collect()
}

#[tokio::test]
async fn create_stores_metadata_and_content() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Pay rent", &[("lease.pdf", "pdf"), ("note.txt", "hi")]))
        .await
        .unwrap();

    assert_eq!(task.user_id, "alice");
    assert_eq!(names(&task), vec!["lease.pdf", "note.txt"]);
    assert_eq!(
        fx.service
            .get_attachment("alice", task.id, "note.txt")
            .await
            .unwrap()
            .unwrap()
            .as_ref(),
        b"hi"
    );
}

#[tokio::test]
async fn invalid_name_is_rejected_before_anything_is_written() {
    let fx = fixture();
    let err = fx
        .service
        .create_task("alice", create("   ", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
    assert!(fx.service.list_active("alice", 0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_reconciles_attachments_and_resets_markers() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Report", &[("a.txt", "A"), ("b.txt", "B")]))
        .await
        .unwrap();

    let updated = fx
        .service
        .update_task(
            "alice",
            task.id,
            UpdateTask {
                name: "Quarterly report".into(),
                expires_at: Some(Utc::now() + Duration::days(5)),
                attachment_names: vec!["b.txt".into(), "c.txt".into()],
                files: vec![AttachmentFile::new("c.txt", "C")],
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "Quarterly report");
    assert!(updated.expiring_info_at.is_none());
    assert!(updated.expired_info_at.is_none());
    assert!(updated.updated_at.is_some());
    assert_eq!(names(&updated), vec!["b.txt", "c.txt"]);
    assert_eq!(
        fx.attachments.list_attachments(task.id).await.unwrap(),
        vec!["b.txt", "c.txt"]
    );
}

#[tokio::test]
async fn update_requires_content_for_new_names() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Report", &[]))
        .await
        .unwrap();

    let err = fx
        .service
        .update_task(
            "alice",
            task.id,
            UpdateTask {
                name: "Report".into(),
                expires_at: None,
                attachment_names: vec!["missing.txt".into()],
                files: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidInput(_)));
    let unchanged = fx.service.get_task("alice", task.id).await.unwrap();
    assert!(unchanged.attachments.is_empty());
    assert!(unchanged.expires_at.is_some());
}

#[tokio::test]
async fn complete_moves_task_to_completed_list() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Call mum", &[]))
        .await
        .unwrap();

    let done = fx.service.complete_task("alice", task.id).await.unwrap();
    assert!(done.completed_at.is_some());
    let again = fx.service.complete_task("alice", task.id).await.unwrap();
    assert_eq!(again.completed_at, done.completed_at);

    assert!(fx.service.list_active("alice", 0, 10).await.unwrap().is_empty());
    let completed = fx.service.list_completed("alice", 0, 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, task.id);
}

#[tokio::test]
async fn delete_removes_row_and_blobs() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Shred", &[("scan.png", "png")]))
        .await
        .unwrap();

    fx.service.delete_task("alice", task.id).await.unwrap();

    assert!(matches!(
        fx.service.get_task("alice", task.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(fx.attachments.list_attachments(task.id).await.unwrap().is_empty());
    assert!(matches!(
        fx.service.delete_task("alice", task.id).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn other_users_cannot_see_or_touch_a_task() {
    let fx = fixture();
    let task = fx
        .service
        .create_task("alice", create("Private", &[("diary.txt", "secret")]))
        .await
        .unwrap();

    assert!(matches!(
        fx.service.get_task("mallory", task.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        fx.service.complete_task("mallory", task.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        fx.service.delete_task("mallory", task.id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(fx
        .service
        .get_attachment("mallory", task.id, "diary.txt")
        .await
        .unwrap()
        .is_none());
    assert!(fx.service.get_task("alice", task.id).await.is_ok());
}
