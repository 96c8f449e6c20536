mod client;
mod resolver;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use taskwatch_broker::Message;
use taskwatch_core::subject::EventSubject;
use taskwatch_core::{NotificationKind, Task, TaskEventMsg};

use crate::dispatch::{HandleError, NotificationHandler};

pub use client::{EmailClient, NullEmailClient, SmtpConfig, SmtpEmailClient};
pub use resolver::{DirectoryEmailResolver, EmailResolver, NullEmailResolver};

pub const EMAIL_CONSUMER: &str = "email";

/// A rendered plain-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Email {
    pub fn render(to: impl Into<String>, kind: NotificationKind, task: &Task) -> Self {
        let due = task
            .expires_at
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "an unknown time".to_string());
        let body = match kind {
            NotificationKind::Expiring => format!(
                "Your task \"{}\" is due at {due}.\n\nComplete it or move the due date if you need more time.\n",
                task.name
            ),
            NotificationKind::Expired => format!(
                "Your task \"{}\" expired at {due}.\n\nIt stays open until you complete or delete it.\n",
                task.name
            ),
        };
        Self {
            to: to.into(),
            subject: format!("{}: {}", kind.title(), task.name),
            body,
        }
    }
}

/// Emails the owner of a task when it is about to expire or has expired.
pub struct EmailNotifier {
    resolver: Arc<dyn EmailResolver>,
    client: Arc<dyn EmailClient>,
}

impl EmailNotifier {
    pub fn new(resolver: Arc<dyn EmailResolver>, client: Arc<dyn EmailClient>) -> Self {
        Self { resolver, client }
    }
}

#[async_trait]
impl NotificationHandler for EmailNotifier {
    fn consumer(&self) -> &str {
        EMAIL_CONSUMER
    }

    async fn handle_message(&self, msg: &dyn Message) -> Result<(), HandleError> {
        let (subject, event) = decode_event(msg)?;
        let to = self.resolver.resolve_email(&subject.user_id).await?;
        let email = Email::render(to, subject.kind, &event.task);
        self.client.send_email(&email).await?;
        info!(
            "emailed {} notice for task {} to user {}",
            subject.kind, subject.task_id, subject.user_id
        );
        Ok(())
    }
}

/// Parse the subject and payload of a task event and check they agree.
pub(crate) fn decode_event(msg: &dyn Message) -> Result<(EventSubject, TaskEventMsg), HandleError> {
    let subject = EventSubject::parse(msg.subject())
        .ok_or_else(|| HandleError::UnknownSubject(msg.subject().to_string()))?;
    let event = TaskEventMsg::decode(msg.data(), subject.kind)?;
    if event.task.id != subject.task_id || event.task.user_id != subject.user_id {
        return Err(HandleError::Invalid(format!(
            "payload for task {} of {} arrived on {}",
            event.task.id,
            event.task.user_id,
            msg.subject()
        )));
    }
    Ok((subject, event))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Duration, TimeZone, Utc};
    use taskwatch_broker::mock::MockMessage;
    use taskwatch_core::subject::event_subject;

    use super::*;
    use crate::dispatch::{deliver, Disposition, REDELIVERY_DELAY};
    use crate::NotifyError;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<Email>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailClient for Outbox {
        async fn send_email(&self, email: &Email) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Send("relay refused".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn task() -> Task {
        let mut task = Task::new(
            "File taxes",
            Some(Utc.with_ymd_and_hms(2026, 4, 15, 9, 30, 0).unwrap()),
        );
        task.id = 7;
        task.user_id = "u-1".into();
        task
    }

    fn message(kind: NotificationKind, task: &Task) -> MockMessage {
        let subject = event_subject(&task.user_id, task.id, kind).unwrap();
        MockMessage::new(&subject, TaskEventMsg::new(task.clone()).to_json().unwrap())
    }

    fn notifier(outbox: Arc<Outbox>) -> EmailNotifier {
        EmailNotifier::new(Arc::new(NullEmailResolver), outbox)
    }

    #[tokio::test]
    async fn expiring_event_sends_one_email_and_acks() {
        let outbox = Arc::new(Outbox::default());
        let msg = message(NotificationKind::Expiring, &task());

        let outcome = deliver(&notifier(outbox.clone()), &msg).await;

        assert_eq!(outcome, Disposition::Acked);
        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "u-1");
        assert_eq!(sent[0].subject, "Task Expiring: File taxes");
        assert!(sent[0].body.contains("2026-04-15 09:30 UTC"));
    }

    #[tokio::test]
    async fn send_failure_is_redelivered() {
        let outbox = Arc::new(Outbox {
            fail: true,
            ..Outbox::default()
        });
        let msg = message(NotificationKind::Expired, &task());

        let outcome = deliver(&notifier(outbox), &msg).await;

        assert_eq!(outcome, Disposition::Redelivery);
        assert_eq!(msg.acks(), 0);
        assert_eq!(msg.nak_delays(), vec![REDELIVERY_DELAY]);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_without_sending() {
        let outbox = Arc::new(Outbox::default());
        let msg = MockMessage::new("task.u-1.7.expired", r#"{"task": 3}"#);

        let outcome = deliver(&notifier(outbox.clone()), &msg).await;

        assert_eq!(outcome, Disposition::Acked);
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subject_and_payload_must_agree() {
        let outbox = Arc::new(Outbox::default());
        let mut other = task();
        other.id = 8;
        let payload = TaskEventMsg::new(other).to_json().unwrap();
        let msg = MockMessage::new("task.u-1.7.expired", payload);

        let outcome = deliver(&notifier(outbox.clone()), &msg).await;

        assert_eq!(outcome, Disposition::Acked);
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_subject_is_acked() {
        let outbox = Arc::new(Outbox::default());
        let msg = MockMessage::new("task.u-1.7.renamed", "{}");
        assert_eq!(deliver(&notifier(outbox), &msg).await, Disposition::Acked);
    }

    #[test]
    fn expired_body_mentions_the_deadline() {
        let mut t = task();
        t.expires_at = t.expires_at.map(|at| at - Duration::days(1));
        let email = Email::render("a@example.com", NotificationKind::Expired, &t);
        assert_eq!(email.subject, "Task Expired: File taxes");
        assert!(email.body.contains("expired at 2026-04-14 09:30 UTC"));
    }
}
