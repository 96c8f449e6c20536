pub mod mock;
mod null;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use null::NullBroker;
pub use sqlite::{BrokerConfig, SqliteBroker};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No durable stream captures the subject.
    #[error("no stream captures subject '{0}'")]
    NoStream(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker is closed")]
    Closed,

    #[error("broker error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One delivered message.
///
/// Durable deliveries stay pending until acked; best-effort deliveries
/// treat ack and nak as no-ops.
#[async_trait]
pub trait Message: Send + Sync {
    /// Unique per published message and stable across redeliveries.
    fn id(&self) -> &str;

    fn subject(&self) -> &str;

    fn data(&self) -> &[u8];

    async fn ack(&self) -> Result<(), BrokerError>;

    /// Make the message eligible for redelivery right away.
    async fn nak(&self) -> Result<(), BrokerError>;

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Box<dyn Message>) -> Result<(), HandlerError>;
}

/// A durable stream and the subject patterns it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: &[&str]) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|p| subject_matches(p, subject))
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Create the stream, or replace its subject list if it exists.
    async fn add_stream(&self, stream: &StreamConfig) -> Result<(), BrokerError>;

    /// Best-effort publish. Nobody listening is not an error.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Append to the stream capturing `subject`. Returns the message id once
    /// the message is stored.
    async fn publish_persistent(&self, subject: &str, payload: Bytes)
        -> Result<String, BrokerError>;

    /// Deliver best-effort messages matching `pattern` to `handler` until
    /// `cancel` fires or the broker closes.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Pull from the durable `consumer` cursor of `stream`, one message at a
    /// time, until `cancel` fires or the broker closes. Never acks on the
    /// handler's behalf.
    async fn subscribe_persistent(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Stop every subscription and refuse further publishes.
    async fn close(&self);
}

/// JSON convenience over [`MessageBroker`].
#[async_trait]
pub trait MessageBrokerExt: MessageBroker {
    async fn send<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(subject, Bytes::from(payload)).await
    }

    async fn send_persistent<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<String, BrokerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_persistent(subject, Bytes::from(payload)).await
    }
}

impl<B: MessageBroker + ?Sized> MessageBrokerExt for B {}

/// Match a dotted subject against a pattern where `*` stands for exactly one
/// token and a trailing `>` for one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Publish subjects must be literal: non-empty tokens and no wildcards.
pub fn validate_subject(subject: &str) -> Result<(), BrokerError> {
    let ok = subject
        .split('.')
        .all(|t| !t.is_empty() && t != "*" && t != ">" && !t.contains(char::is_whitespace));
    if ok {
        Ok(())
    } else {
        Err(BrokerError::InvalidSubject(subject.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(subject_matches("task.u.1.expired", "task.u.1.expired"));
        assert!(!subject_matches("task.u.1.expired", "task.u.1"));
        assert!(!subject_matches("task.u.1", "task.u.1.expired"));
    }

    #[test]
    fn star_matches_one_token() {
        assert!(subject_matches("task.*.1.expired", "task.u.1.expired"));
        assert!(!subject_matches("task.*", "task.u.1"));
        assert!(!subject_matches("task.*", "task"));
    }

    #[test]
    fn gt_matches_one_or_more_trailing_tokens() {
        assert!(subject_matches("task.>", "task.u.1.expiring"));
        assert!(subject_matches("task.>", "task.u"));
        assert!(!subject_matches("task.>", "task"));
        assert!(!subject_matches("task.>", "tasks.ui.u.1.expired"));
        assert!(subject_matches("tasks.ui.u.>", "tasks.ui.u.1.expired"));
    }

    #[test]
    fn publish_subjects_must_be_literal() {
        assert!(validate_subject("task.u.1.expired").is_ok());
        assert!(validate_subject("task.*.1").is_err());
        assert!(validate_subject("task..1").is_err());
        assert!(validate_subject("").is_err());
    }

    #[test]
    fn stream_captures_any_of_its_subjects() {
        let stream = StreamConfig::new("tasks", &["task.>", "audit.*"]);
        assert!(stream.captures("task.u.1.expired"));
        assert!(stream.captures("audit.x"));
        assert!(!stream.captures("audit.x.y"));
    }
}
