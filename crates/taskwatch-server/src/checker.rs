use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskwatch_broker::{BrokerError, MessageBroker, MessageBrokerExt};
use taskwatch_core::subject::event_subject;
use taskwatch_core::{CoreError, NotificationKind, Scope, Task, TaskEventMsg};
use taskwatch_db::{Database, DbError};
use taskwatch_store::AttachmentStore;

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub interval: StdDuration,
    /// Tasks due within this window get an expiring notice.
    pub expiring_window: Duration,
    /// Completed tasks older than this are deleted.
    pub delete_window: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(60),
            expiring_window: Duration::hours(24),
            delete_window: Duration::hours(48),
        }
    }
}

/// One thing that went wrong during a check run.
#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error("{sweep} sweep: {source}")]
    Query {
        sweep: &'static str,
        #[source]
        source: DbError,
    },

    #[error("task {task_id}: bad {kind} subject: {source}")]
    Subject {
        task_id: i64,
        kind: NotificationKind,
        #[source]
        source: CoreError,
    },

    #[error("task {task_id}: publish {kind}: {source}")]
    Publish {
        task_id: i64,
        kind: NotificationKind,
        #[source]
        source: BrokerError,
    },

    #[error("task {task_id}: mark {kind}: {source}")]
    Mark {
        task_id: i64,
        kind: NotificationKind,
        #[source]
        source: DbError,
    },

    #[error("check run panicked: {0}")]
    Panicked(String),
}

/// Every failure of a single check run.
#[derive(Debug, Error)]
#[error("{} check failure(s): {}", .failures.len(), summary(.failures))]
pub struct CheckError {
    pub failures: Vec<CheckFailure>,
}

fn summary(failures: &[CheckFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Counts from a successful check run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub purged: usize,
    pub expiring: usize,
    pub expired: usize,
}

/// Periodic sweep over the task store: purge old completed tasks, then
/// publish expiring and expired notices and mark each task once its notice
/// is durably published.
pub struct Checker {
    db: Arc<dyn Database>,
    broker: Arc<dyn MessageBroker>,
    attachments: AttachmentStore,
    config: CheckerConfig,
}

impl Checker {
    pub fn new(
        db: Arc<dyn Database>,
        broker: Arc<dyn MessageBroker>,
        attachments: AttachmentStore,
        config: CheckerConfig,
    ) -> Self {
        Self {
            db,
            broker,
            attachments,
            config,
        }
    }

    /// Tick until `cancel` fires. A run in progress finishes first.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "checker started (interval {:?}, expiring window {}, delete window {})",
            self.config.interval, self.config.expiring_window, self.config.delete_window
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.check().await {
                error!("check run failed: {e}");
            }
        }
        info!("checker stopped");
    }

    /// One run, with panics reported as a failed run.
    pub async fn check(&self) -> Result<CheckReport, CheckError> {
        match AssertUnwindSafe(self.check_at(Utc::now()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(CheckError {
                    failures: vec![CheckFailure::Panicked(reason)],
                })
            }
        }
    }

    /// One run as if the clock read `now`. Selection, purge cutoff and the
    /// markers written all use it.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<CheckReport, CheckError> {
        let mut failures = Vec::new();
        let mut report = CheckReport::default();

        match self.sweep_completed(now).await {
            Ok(n) => report.purged = n,
            Err(source) => failures.push(CheckFailure::Query {
                sweep: "completed",
                source,
            }),
        }

        match self
            .db
            .get_expiring_at(&Scope::System, now, self.config.expiring_window)
            .await
        {
            Ok(tasks) => {
                report.expiring = self
                    .notify_all(tasks, NotificationKind::Expiring, now, &mut failures)
                    .await
            }
            Err(source) => failures.push(CheckFailure::Query {
                sweep: "expiring",
                source,
            }),
        }

        match self.db.get_expired_at(&Scope::System, now).await {
            Ok(tasks) => {
                report.expired = self
                    .notify_all(tasks, NotificationKind::Expired, now, &mut failures)
                    .await
            }
            Err(source) => failures.push(CheckFailure::Query {
                sweep: "expired",
                source,
            }),
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CheckError { failures })
        }
    }

    async fn sweep_completed(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let purged = self
            .db
            .purge_completed_at(&Scope::System, now, self.config.delete_window)
            .await?;
        if !purged.is_empty() {
            info!("deleted {} completed task(s)", purged.len());
        }
        for id in &purged {
            if let Err(e) = self.attachments.delete_task(*id).await {
                warn!("task {id} purged but its attachments were not: {e}");
            }
        }
        Ok(purged.len())
    }

    async fn notify_all(
        &self,
        tasks: Vec<Task>,
        kind: NotificationKind,
        now: DateTime<Utc>,
        failures: &mut Vec<CheckFailure>,
    ) -> usize {
        let mut sent = 0;
        for task in tasks {
            match self.notify(task, kind, now).await {
                Ok(()) => sent += 1,
                Err(CheckFailure::Mark {
                    task_id,
                    source: DbError::NotFound(_),
                    ..
                }) => info!("task {task_id} disappeared before it could be marked {kind}"),
                Err(failure) => failures.push(failure),
            }
        }
        if sent > 0 {
            info!("published {sent} {kind} notice(s)");
        }
        sent
    }

    async fn notify(
        &self,
        mut task: Task,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<(), CheckFailure> {
        let task_id = task.id;
        let subject = event_subject(&task.user_id, task_id, kind).map_err(|source| {
            CheckFailure::Subject {
                task_id,
                kind,
                source,
            }
        })?;

        self.broker
            .send_persistent(&subject, &TaskEventMsg::new(task.clone()))
            .await
            .map_err(|source| CheckFailure::Publish {
                task_id,
                kind,
                source,
            })?;

        match kind {
            NotificationKind::Expiring => task.set_expiring_info_at(now),
            NotificationKind::Expired => task.set_expired_info_at(now),
        }
        self.db
            .update_task(&Scope::System, &task)
            .await
            .map_err(|source| CheckFailure::Mark {
                task_id,
                kind,
                source,
            })
    }
}
