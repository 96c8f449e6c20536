//! Settling durable deliveries.
//!
//! A [`NotificationHandler`] only decides what a message means. [`deliver`]
//! turns that decision into an ack or a delayed redelivery, and is the one
//! place panics from handler code are caught.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskwatch_broker::{BrokerError, HandlerError, Message, MessageBroker, MessageHandler};
use taskwatch_core::subject::TASKS_STREAM;
use taskwatch_core::CoreError;

use crate::NotifyError;

/// Delay before a failed or panicked delivery is retried.
pub const REDELIVERY_DELAY: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum HandleError {
    /// The payload can never be processed. Acked so it is not redelivered.
    #[error("invalid payload: {0}")]
    Invalid(String),

    /// Well-formed message on a subject this handler does not know.
    #[error("unknown subject '{0}'")]
    UnknownSubject(String),

    /// Resolution or the side effect failed; worth retrying.
    #[error("{0}")]
    Transient(String),
}

impl From<NotifyError> for HandleError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::InvalidRecipient(_) => HandleError::Invalid(e.to_string()),
            _ => HandleError::Transient(e.to_string()),
        }
    }
}

impl From<BrokerError> for HandleError {
    fn from(e: BrokerError) -> Self {
        HandleError::Transient(e.to_string())
    }
}

impl From<CoreError> for HandleError {
    fn from(e: CoreError) -> Self {
        HandleError::Invalid(e.to_string())
    }
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Durable consumer name on the tasks stream.
    fn consumer(&self) -> &str;

    async fn handle_message(&self, msg: &dyn Message) -> Result<(), HandleError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Redelivery,
}

/// Run `handler` on `msg` and settle it.
pub async fn deliver(handler: &dyn NotificationHandler, msg: &dyn Message) -> Disposition {
    let consumer = handler.consumer();
    let outcome = AssertUnwindSafe(handler.handle_message(msg))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            debug!("{consumer}: handled {} ({})", msg.subject(), msg.id());
            ack(consumer, msg).await
        }
        Ok(Err(e @ (HandleError::Invalid(_) | HandleError::UnknownSubject(_)))) => {
            warn!("{consumer}: dropping {} ({}): {e}", msg.subject(), msg.id());
            ack(consumer, msg).await
        }
        Ok(Err(HandleError::Transient(e))) => {
            warn!("{consumer}: {} failed, redelivering: {e}", msg.subject());
            redeliver(consumer, msg).await
        }
        Err(panic) => {
            error!(
                "{consumer}: handler panicked on {}: {}",
                msg.subject(),
                panic_message(&*panic)
            );
            redeliver(consumer, msg).await
        }
    }
}

async fn ack(consumer: &str, msg: &dyn Message) -> Disposition {
    if let Err(e) = msg.ack().await {
        error!("{consumer}: ack of {} failed: {e}", msg.id());
    }
    Disposition::Acked
}

async fn redeliver(consumer: &str, msg: &dyn Message) -> Disposition {
    if let Err(e) = msg.nak_with_delay(REDELIVERY_DELAY).await {
        error!("{consumer}: nak of {} failed: {e}", msg.id());
    }
    Disposition::Redelivery
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Adapts a [`NotificationHandler`] to the broker's subscription callback.
struct Durable(Arc<dyn NotificationHandler>);

#[async_trait]
impl MessageHandler for Durable {
    async fn handle(&self, msg: Box<dyn Message>) -> Result<(), HandlerError> {
        deliver(self.0.as_ref(), msg.as_ref()).await;
        Ok(())
    }
}

/// Consume the tasks stream with `handler` until `cancel` fires.
pub async fn consume(
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn NotificationHandler>,
    cancel: CancellationToken,
) -> Result<(), NotifyError> {
    let consumer = handler.consumer().to_string();
    info!("{consumer} started");
    let result = broker
        .subscribe_persistent(TASKS_STREAM, &consumer, Arc::new(Durable(handler)), cancel)
        .await;
    info!("{consumer} stopped");
    Ok(result?)
}
