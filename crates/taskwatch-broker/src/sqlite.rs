//! Durable streams stored in SQLite.
//!
//! Every stream is an append-only run of rows in `broker_messages`. A durable
//! consumer owns a cursor (`broker_consumers.delivered_seq`) plus one
//! `broker_pending` row per delivered but unacknowledged message. A pending
//! row becomes deliverable again once `deliver_after` passes, which is how
//! ack timeouts, `nak` and `nak_with_delay` all turn into redelivery.
//! Each claim bumps `delivery_count`, and settling only touches the row
//! still carrying the claim's count.
//!
//! Acks prune `broker_messages`: a message goes once it is older than the
//! retention period, every registered consumer's cursor has passed it and
//! none has it pending.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    subject_matches, validate_subject, BrokerError, Message, MessageBroker, MessageHandler,
    StreamConfig,
};

const FANOUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// How long a delivery may stay unacknowledged before it is redelivered.
    pub ack_wait: Duration,
    /// Upper bound on how long an idle consumer sleeps between fetches.
    pub poll_interval: Duration,
    /// Acknowledged messages younger than this are kept, so a consumer
    /// that registers late still sees recent history.
    pub retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: None,
            ack_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            retention: Duration::from_secs(3600),
        }
    }
}

trait SqliteResultExt<T> {
    fn to_broker(self) -> Result<T, BrokerError>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn to_broker(self) -> Result<T, BrokerError> {
        self.map_err(|e| BrokerError::Internal(e.to_string()))
    }
}

struct Inner {
    conn: Arc<Mutex<Connection>>,
    ack_wait: Duration,
    poll_interval: Duration,
    retention: Duration,
    fanout: broadcast::Sender<EphemeralMessage>,
    published: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    async fn with_conn<F, T>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, BrokerError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| BrokerError::Internal(e.to_string()))?
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn fan_out(&self, msg: EphemeralMessage) {
        if self.fanout.send(msg).is_err() {
            debug!("no live subscribers");
        }
    }
}

/// SQLite-backed [`MessageBroker`].
///
/// Durable messages survive restarts; best-effort fan-out stays in process.
#[derive(Clone)]
pub struct SqliteBroker {
    inner: Arc<Inner>,
}

impl SqliteBroker {
    pub fn open(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let conn = match &config.path {
            Some(path) => open_file(path)?,
            None => Connection::open_in_memory().to_broker()?,
        };
        migrate(&conn)?;
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Arc::new(Mutex::new(conn)),
                ack_wait: config.ack_wait,
                poll_interval: config.poll_interval,
                retention: config.retention,
                fanout,
                published: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn open_in_memory() -> Result<Self, BrokerError> {
        Self::open(&BrokerConfig::default())
    }

    async fn fetch_next(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Option<DurableMessage>, BrokerError> {
        let stream = stream.to_string();
        let consumer = consumer.to_string();
        let ack_wait = millis(self.inner.ack_wait);
        let delivery = self
            .inner
            .with_conn(move |conn| fetch_delivery(conn, &stream, &consumer, now_ms(), ack_wait))
            .await?;
        Ok(delivery.map(|d| DurableMessage {
            inner: self.inner.clone(),
            delivery: d,
        }))
    }
}

fn open_file(path: &Path) -> Result<Connection, BrokerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).to_broker()?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=5000;",
    )
    .to_broker()?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<(), BrokerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS broker_schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .to_broker()?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM broker_schema_version",
            [],
            |r| r.get(0),
        )
        .to_broker()?;

    if current_version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS broker_streams (
                 name     TEXT PRIMARY KEY,
                 subjects TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS broker_messages (
                 seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                 stream       TEXT NOT NULL,
                 subject      TEXT NOT NULL,
                 msg_id       TEXT NOT NULL UNIQUE,
                 payload      BLOB NOT NULL,
                 published_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_broker_messages_stream
                 ON broker_messages(stream, seq);

             CREATE TABLE IF NOT EXISTS broker_consumers (
                 stream        TEXT NOT NULL,
                 name          TEXT NOT NULL,
                 delivered_seq INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (stream, name)
             );

             CREATE TABLE IF NOT EXISTS broker_pending (
                 stream         TEXT NOT NULL,
                 consumer       TEXT NOT NULL,
                 seq            INTEGER NOT NULL,
                 deliver_after  INTEGER NOT NULL,
                 delivery_count INTEGER NOT NULL,
                 PRIMARY KEY (stream, consumer, seq)
             );
             CREATE INDEX IF NOT EXISTS idx_broker_pending_due
                 ON broker_pending(stream, consumer, deliver_after);

             INSERT INTO broker_schema_version (version, applied_at)
                 VALUES (1, datetime('now'));",
        )
        .to_broker()?;
    }

    Ok(())
}

fn load_streams(conn: &Connection) -> Result<Vec<StreamConfig>, BrokerError> {
    let mut stmt = conn
        .prepare("SELECT name, subjects FROM broker_streams ORDER BY name")
        .to_broker()?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .to_broker()?;
    let mut streams = Vec::new();
    for row in rows {
        let (name, subjects) = row.to_broker()?;
        let subjects: Vec<String> = serde_json::from_str(&subjects)?;
        streams.push(StreamConfig { name, subjects });
    }
    Ok(streams)
}

struct Delivery {
    stream: String,
    consumer: String,
    seq: i64,
    msg_id: String,
    subject: String,
    payload: Bytes,
    delivery_count: u32,
}

/// Claim the next deliverable message for a consumer: a due redelivery
/// first, otherwise the next message past the cursor.
fn fetch_delivery(
    conn: &mut Connection,
    stream: &str,
    consumer: &str,
    now: i64,
    ack_wait: i64,
) -> Result<Option<Delivery>, BrokerError> {
    let tx = conn.transaction().to_broker()?;

    tx.execute(
        "INSERT OR IGNORE INTO broker_consumers (stream, name, delivered_seq) VALUES (?1, ?2, 0)",
        params![stream, consumer],
    )
    .to_broker()?;

    let due = tx
        .query_row(
            "SELECT p.seq, m.msg_id, m.subject, m.payload, p.delivery_count
             FROM broker_pending p
             JOIN broker_messages m ON m.seq = p.seq
             WHERE p.stream = ?1 AND p.consumer = ?2 AND p.deliver_after <= ?3
             ORDER BY p.deliver_after ASC, p.seq ASC
             LIMIT 1",
            params![stream, consumer, now],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .to_broker()?;

    let delivery = if let Some((seq, msg_id, subject, payload, count)) = due {
        tx.execute(
            "UPDATE broker_pending SET deliver_after = ?4, delivery_count = delivery_count + 1
             WHERE stream = ?1 AND consumer = ?2 AND seq = ?3",
            params![stream, consumer, seq, now + ack_wait],
        )
        .to_broker()?;
        Some((seq, msg_id, subject, payload, count + 1))
    } else {
        let next = tx
            .query_row(
                "SELECT m.seq, m.msg_id, m.subject, m.payload
                 FROM broker_messages m
                 WHERE m.stream = ?1 AND m.seq > (
                     SELECT delivered_seq FROM broker_consumers WHERE stream = ?1 AND name = ?2
                 )
                 ORDER BY m.seq ASC
                 LIMIT 1",
                params![stream, consumer],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()
            .to_broker()?;
        match next {
            Some((seq, msg_id, subject, payload)) => {
                tx.execute(
                    "INSERT INTO broker_pending (stream, consumer, seq, deliver_after, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    params![stream, consumer, seq, now + ack_wait],
                )
                .to_broker()?;
                tx.execute(
                    "UPDATE broker_consumers SET delivered_seq = ?3 WHERE stream = ?1 AND name = ?2",
                    params![stream, consumer, seq],
                )
                .to_broker()?;
                Some((seq, msg_id, subject, payload, 1))
            }
            None => None,
        }
    };

    tx.commit().to_broker()?;

    Ok(
        delivery.map(|(seq, msg_id, subject, payload, count)| Delivery {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            seq,
            msg_id,
            subject,
            payload: Bytes::from(payload),
            delivery_count: u32::try_from(count).unwrap_or(u32::MAX),
        }),
    )
}

/// Drop messages published at or before `cutoff` that every registered
/// consumer has moved past and acknowledged. A stream nobody has consumed
/// yet keeps everything.
fn prune_acked(conn: &Connection, stream: &str, cutoff: i64) -> Result<usize, BrokerError> {
    conn.execute(
        "DELETE FROM broker_messages
         WHERE stream = ?1
           AND published_at <= ?2
           AND seq <= (SELECT MIN(delivered_seq) FROM broker_consumers WHERE stream = ?1)
           AND NOT EXISTS (
               SELECT 1 FROM broker_pending p WHERE p.stream = ?1 AND p.seq = broker_messages.seq
           )",
        params![stream, cutoff],
    )
    .to_broker()
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    async fn add_stream(&self, stream: &StreamConfig) -> Result<(), BrokerError> {
        self.inner.check_open()?;
        if stream.name.is_empty() || stream.subjects.is_empty() {
            return Err(BrokerError::Internal(format!(
                "stream '{}' needs a name and at least one subject",
                stream.name
            )));
        }
        let name = stream.name.clone();
        let subjects = serde_json::to_string(&stream.subjects)?;
        self.inner
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO broker_streams (name, subjects) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET subjects = excluded.subjects",
                    params![name, subjects],
                )
                .to_broker()?;
                Ok(())
            })
            .await?;
        info!("stream {} captures {:?}", stream.name, stream.subjects);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.inner.check_open()?;
        validate_subject(subject)?;
        self.inner.fan_out(EphemeralMessage {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<String, BrokerError> {
        self.inner.check_open()?;
        validate_subject(subject)?;

        let msg_id = uuid::Uuid::new_v4().to_string();
        {
            let subject = subject.to_string();
            let msg_id = msg_id.clone();
            let payload = payload.clone();
            self.inner
                .with_conn(move |conn| {
                    let stream = load_streams(conn)?
                        .into_iter()
                        .find(|s| s.captures(&subject))
                        .ok_or_else(|| BrokerError::NoStream(subject.clone()))?;
                    conn.execute(
                        "INSERT INTO broker_messages (stream, subject, msg_id, payload, published_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![stream.name, subject, msg_id, &payload[..], now_ms()],
                    )
                    .to_broker()?;
                    Ok(())
                })
                .await?;
        }

        self.inner.published.notify_waiters();
        self.inner.fan_out(EphemeralMessage {
            id: msg_id.clone(),
            subject: subject.to_string(),
            payload,
        });
        Ok(msg_id)
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.inner.check_open()?;
        let mut rx = self.inner.fanout.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(msg) => {
                        if !subject_matches(pattern, &msg.subject) {
                            continue;
                        }
                        let subject = msg.subject.clone();
                        if let Err(e) = handler.handle(Box::new(msg)).await {
                            warn!("handler for {subject} failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("subscriber on {pattern} fell behind, {skipped} messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn subscribe_persistent(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.inner.check_open()?;
        info!("consumer {consumer} attached to stream {stream}");
        loop {
            if cancel.is_cancelled() || self.inner.shutdown.is_cancelled() {
                break;
            }
            // Registered before fetching so a publish in between still wakes us.
            let published = self.inner.published.notified();

            match self.fetch_next(stream, consumer).await {
                Ok(Some(msg)) => {
                    let subject = msg.delivery.subject.clone();
                    debug!(
                        "consumer {consumer} delivery {} of {subject}",
                        msg.delivery.delivery_count
                    );
                    if let Err(e) = handler.handle(Box::new(msg)).await {
                        warn!("consumer {consumer} failed on {subject}: {e}");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("consumer {consumer} fetch from {stream} failed: {e}"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                _ = published => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
        info!("consumer {consumer} detached from stream {stream}");
        Ok(())
    }

    async fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            self.inner.shutdown.cancel();
            info!("broker closed");
        }
    }
}

/// A claimed durable delivery.
struct DurableMessage {
    inner: Arc<Inner>,
    delivery: Delivery,
}

impl DurableMessage {
    /// Settle this claim. A claim that was already superseded by a
    /// redelivery matches no row and changes nothing.
    async fn settle(&self, deliver_after: Option<i64>) -> Result<(), BrokerError> {
        let stream = self.delivery.stream.clone();
        let consumer = self.delivery.consumer.clone();
        let seq = self.delivery.seq;
        let count = i64::from(self.delivery.delivery_count);
        let cutoff = now_ms() - millis(self.inner.retention);
        let settled = self
            .inner
            .with_conn(move |conn| {
                let settled = match deliver_after {
                    None => conn.execute(
                        "DELETE FROM broker_pending
                         WHERE stream = ?1 AND consumer = ?2 AND seq = ?3 AND delivery_count = ?4",
                        params![stream, consumer, seq, count],
                    ),
                    Some(at) => conn.execute(
                        "UPDATE broker_pending SET deliver_after = ?5
                         WHERE stream = ?1 AND consumer = ?2 AND seq = ?3 AND delivery_count = ?4",
                        params![stream, consumer, seq, count, at],
                    ),
                }
                .to_broker()?;
                if settled > 0 && deliver_after.is_none() {
                    let pruned = prune_acked(conn, &stream, cutoff)?;
                    if pruned > 0 {
                        debug!("pruned {pruned} acknowledged message(s) from {stream}");
                    }
                }
                Ok(settled > 0)
            })
            .await?;
        if !settled {
            debug!(
                "delivery {} of {} was superseded, settle ignored",
                self.delivery.delivery_count, self.delivery.msg_id
            );
        } else if deliver_after.is_some() {
            self.inner.published.notify_waiters();
        }
        Ok(())
    }

    #[cfg(test)]
    fn delivery_count(&self) -> u32 {
        self.delivery.delivery_count
    }
}

#[async_trait]
impl Message for DurableMessage {
    fn id(&self) -> &str {
        &self.delivery.msg_id
    }

    fn subject(&self) -> &str {
        &self.delivery.subject
    }

    fn data(&self) -> &[u8] {
        &self.delivery.payload
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None).await
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.settle(Some(now_ms())).await
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError> {
        self.settle(Some(now_ms() + millis(delay))).await
    }
}

/// Best-effort delivery. There is nothing to settle.
#[derive(Debug, Clone)]
struct EphemeralMessage {
    id: String,
    subject: String,
    payload: Bytes,
}

#[async_trait]
impl Message for EphemeralMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn data(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nak_with_delay(&self, _delay: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
