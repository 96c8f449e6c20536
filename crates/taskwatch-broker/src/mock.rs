//! Recording test doubles.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    subject_matches, validate_subject, BrokerError, Message, MessageBroker, MessageHandler,
    StreamConfig,
};

/// One publish seen by a [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub payload: Bytes,
    pub persistent: bool,
}

/// Broker that records publishes instead of delivering them.
///
/// Built with [`MockBroker::with_stream_check`], durable publishes on subjects
/// no added stream captures fail with [`BrokerError::NoStream`].
#[derive(Default)]
pub struct MockBroker {
    published: Mutex<Vec<Published>>,
    streams: Mutex<Vec<StreamConfig>>,
    check_streams: bool,
    fail_all: AtomicBool,
    failing_subjects: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject durable publishes on subjects no added stream captures.
    pub fn with_stream_check(mut self) -> Self {
        self.check_streams = true;
        self
    }

    /// Make every publish fail until switched back off.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Make publishes on exactly this subject fail.
    pub fn fail_subject(&self, subject: &str) {
        if let Ok(mut subjects) = self.failing_subjects.lock() {
            subjects.insert(subject.to_string());
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn persistent_subjects(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|p| p.persistent)
            .map(|p| p.subject)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, subject: &str, payload: Bytes, persistent: bool) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        validate_subject(subject)?;
        let failing = self.fail_all.load(Ordering::SeqCst)
            || self
                .failing_subjects
                .lock()
                .map(|s| s.contains(subject))
                .unwrap_or(false);
        if failing {
            return Err(BrokerError::Internal(format!("injected failure on {subject}")));
        }
        if persistent && self.check_streams {
            let captured = self
                .streams
                .lock()
                .map(|streams| streams.iter().any(|s| s.captures(subject)))
                .unwrap_or(false);
            if !captured {
                return Err(BrokerError::NoStream(subject.to_string()));
            }
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(Published {
                subject: subject.to_string(),
                payload,
                persistent,
            });
        }
        Ok(())
    }

    async fn idle(&self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn add_stream(&self, stream: &StreamConfig) -> Result<(), BrokerError> {
        if let Ok(mut streams) = self.streams.lock() {
            streams.retain(|s| s.name != stream.name);
            streams.push(stream.clone());
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.record(subject, payload, false)
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<String, BrokerError> {
        self.record(subject, payload, true)?;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn subscribe(
        &self,
        _pattern: &str,
        _handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.idle(cancel).await;
        Ok(())
    }

    async fn subscribe_persistent(
        &self,
        _stream: &str,
        _consumer: &str,
        _handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.idle(cancel).await;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

#[derive(Default)]
struct Settlements {
    acks: AtomicUsize,
    naks: AtomicUsize,
    delays: Mutex<Vec<Duration>>,
}

/// Message that counts how it was settled. Clones share the counters, so a
/// test can hand one clone to a handler and inspect the other.
#[derive(Clone)]
pub struct MockMessage {
    id: String,
    subject: String,
    data: Bytes,
    settlements: Arc<Settlements>,
    fail_settle: bool,
}

impl MockMessage {
    pub fn new(subject: &str, data: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            data: data.into(),
            settlements: Arc::default(),
            fail_settle: false,
        }
    }

    /// Every ack and nak is counted and then reported as failed.
    pub fn failing_settle(mut self) -> Self {
        self.fail_settle = true;
        self
    }

    pub fn acks(&self) -> usize {
        self.settlements.acks.load(Ordering::SeqCst)
    }

    pub fn naks(&self) -> usize {
        self.settlements.naks.load(Ordering::SeqCst)
    }

    pub fn nak_delays(&self) -> Vec<Duration> {
        self.settlements
            .delays
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn settled(&self) -> Result<(), BrokerError> {
        if self.fail_settle {
            Err(BrokerError::Internal("injected settle failure".into()))
        } else {
            Ok(())
        }
    }

    /// Whether this message would reach a subscriber of `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        subject_matches(pattern, &self.subject)
    }
}

#[async_trait]
impl Message for MockMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settlements.acks.fetch_add(1, Ordering::SeqCst);
        self.settled()
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.settlements.naks.fetch_add(1, Ordering::SeqCst);
        self.settled()
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError> {
        if let Ok(mut delays) = self.settlements.delays.lock() {
            delays.push(delay);
        }
        self.settled()
    }
}
