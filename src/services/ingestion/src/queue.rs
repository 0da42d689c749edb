//! The webhook work queue
//!
//! The receiver enqueues accepted deliveries and returns 200 immediately;
//! a pool of workers drains the queue. Backed by a Redis list for
//! at-least-once durability; an in-process queue stands in when Redis is
//! not configured (acceptable for dev, the bytes are also in the webhook
//! log for replay).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use revwatch_shared::Source;

use crate::error::{IngestionError, Result};

const QUEUE_KEY: &str = "revwatch:webhook_queue";

/// One accepted delivery, as handed from receiver to worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub org_id: Uuid,
    pub source: Source,
    pub webhook_log_id: Uuid,
    #[serde(with = "raw_body_b64")]
    pub raw_body: Vec<u8>,
    pub raw_headers: std::collections::HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    /// Synthesized by backfill; the bytes never touched the wire so the
    /// signature step is skipped
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub attempt: u32,
}

mod raw_body_b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        BASE64.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Queue capability shared by receiver, workers, and backfill
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: WebhookJob) -> Result<()>;
    /// Blocks up to `timeout`; `None` on timeout or closed queue
    async fn dequeue(&self, timeout: Duration) -> Result<Option<WebhookJob>>;
    async fn depth(&self) -> Result<usize>;
    /// Stop accepting work so workers can drain and exit
    fn close(&self);
}

/// In-process fallback queue
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<WebhookJob>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: WebhookJob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestionError::queue("queue is closed"));
        }
        self.jobs.lock().await.push_back(job);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<WebhookJob>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.lock().await.pop_front() {
                return Ok(Some(job));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.jobs.lock().await.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Redis-backed durable queue (LPUSH / BRPOP on a single list)
pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
    closed: AtomicBool,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key: QUEUE_KEY.to_string(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: WebhookJob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestionError::queue("queue is closed"));
        }
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, payload).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<WebhookJob>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
