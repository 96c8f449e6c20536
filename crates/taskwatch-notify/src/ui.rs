use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use taskwatch_broker::{Message, MessageBroker, MessageBrokerExt};
use taskwatch_core::subject::ui_subject;

use crate::dispatch::{HandleError, NotificationHandler};
use crate::email::decode_event;

pub const UI_CONSUMER: &str = "ui";

/// Relays task events to the best-effort subjects live UI sessions listen on.
pub struct UiNotifier {
    broker: Arc<dyn MessageBroker>,
}

impl UiNotifier {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl NotificationHandler for UiNotifier {
    fn consumer(&self) -> &str {
        UI_CONSUMER
    }

    async fn handle_message(&self, msg: &dyn Message) -> Result<(), HandleError> {
        let (subject, event) = decode_event(msg)?;
        let target = ui_subject(&subject.user_id, subject.task_id, subject.kind)?;
        self.broker.send(&target, &event).await?;
        debug!("relayed {} to {target}", msg.subject());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use taskwatch_broker::mock::{MockBroker, MockMessage};
    use taskwatch_core::{Task, TaskEventMsg};

    use super::*;
    use crate::dispatch::{deliver, Disposition, REDELIVERY_DELAY};

    fn event_message() -> (MockMessage, TaskEventMsg) {
        let mut task = Task::new("Water plants", Some(Utc::now() - Duration::minutes(5)));
        task.id = 3;
        task.user_id = "u-9".into();
        let event = TaskEventMsg::new(task);
        let msg = MockMessage::new("task.u-9.3.expired", event.to_json().unwrap());
        (msg, event)
    }

    #[tokio::test]
    async fn relays_to_the_user_ui_subject() {
        let broker = Arc::new(MockBroker::new());
        let notifier = UiNotifier::new(broker.clone());
        let (msg, event) = event_message();

        assert_eq!(deliver(&notifier, &msg).await, Disposition::Acked);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "tasks.ui.u-9.3.expired");
        assert!(!published[0].persistent);
        let relayed: TaskEventMsg = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(relayed, event);
    }

    #[tokio::test]
    async fn failed_relay_is_redelivered() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_publishes(true);
        let notifier = UiNotifier::new(broker.clone());
        let (msg, _) = event_message();

        assert_eq!(deliver(&notifier, &msg).await, Disposition::Redelivery);
        assert_eq!(msg.acks(), 0);
        assert_eq!(msg.nak_delays(), vec![REDELIVERY_DELAY]);
    }
}
