use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{validate_subject, BrokerError, MessageBroker, MessageHandler, StreamConfig};

/// Broker that drops every publish. Subscriptions idle until cancelled or
/// closed.
#[derive(Debug, Default)]
pub struct NullBroker {
    shutdown: CancellationToken,
}

impl NullBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBroker for NullBroker {
    async fn add_stream(&self, stream: &StreamConfig) -> Result<(), BrokerError> {
        debug!("null broker: stream {} ignored", stream.name);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        validate_subject(subject)?;
        debug!("null broker: dropped {} bytes on {subject}", payload.len());
        Ok(())
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<String, BrokerError> {
        validate_subject(subject)?;
        debug!("null broker: dropped {} durable bytes on {subject}", payload.len());
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn subscribe(
        &self,
        _pattern: &str,
        _handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
        Ok(())
    }

    async fn subscribe_persistent(
        &self,
        _stream: &str,
        _consumer: &str,
        _handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}
