//! Backfill progress documents
//!
//! Stored under `backfill:{source}:{org_id}` with a 24 h TTL. The runner
//! updates the document between pages; the setup API reads it for the
//! progress endpoint and flips `cancel_requested` to abort a run cleanly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use revwatch_shared::Source;

use crate::error::Result;

pub const PROGRESS_TTL_SECS: u64 = 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Queued,
    Counting,
    ImportingSubscriptions,
    ImportingEvents,
    Completed,
    Failed,
}

/// Human-readable description of the current stage
pub type BackfillPhase = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillProgress {
    pub job_id: Uuid,
    pub status: BackfillStatus,
    pub phase: BackfillPhase,
    pub total_customers: u64,
    pub imported_customers: u64,
    pub total_events: u64,
    pub imported_events: u64,
    pub events_created: u64,
    pub issues_found: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_seconds_remaining: Option<u64>,
    pub processing_rate_per_second: f64,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl BackfillProgress {
    pub fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: BackfillStatus::Queued,
            phase: "queued".to_string(),
            total_customers: 0,
            imported_customers: 0,
            total_events: 0,
            imported_events: 0,
            events_created: 0,
            issues_found: 0,
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            estimated_seconds_remaining: None,
            processing_rate_per_second: 0.0,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            BackfillStatus::Completed | BackfillStatus::Failed
        )
    }

    /// Rate sampled over elapsed wall clock; ETA is remaining over the
    /// rate with a floor so a cold start never divides by zero
    pub fn update_rate(&mut self, elapsed_secs: f64) {
        let done = self.imported_customers + self.imported_events;
        let total = self.total_customers + self.total_events;
        self.processing_rate_per_second = if elapsed_secs > 0.0 {
            done as f64 / elapsed_secs
        } else {
            0.0
        };
        let remaining = total.saturating_sub(done);
        self.estimated_seconds_remaining =
            Some((remaining as f64 / self.processing_rate_per_second.max(0.1)).ceil() as u64);
    }
}

pub fn progress_key(source: Source, org_id: Uuid) -> String {
    format!("backfill:{}:{}", source, org_id)
}

pub fn lock_key(source: Source, org_id: Uuid) -> String {
    format!("backfill-lock:{}:{}", source, org_id)
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, key: &str, progress: &BackfillProgress) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<BackfillProgress>>;
}

/// In-process progress store (dev mode without Redis)
#[derive(Default)]
pub struct MemoryProgressStore {
    docs: Mutex<HashMap<String, BackfillProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn save(&self, key: &str, progress: &BackfillProgress) -> Result<()> {
        self.docs
            .lock()
            .await
            .insert(key.to_string(), progress.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<BackfillProgress>> {
        Ok(self.docs.lock().await.get(key).cloned())
    }
}

/// Redis-backed progress with the 24 h TTL
pub struct RedisProgressStore {
    conn: ConnectionManager,
}

impl RedisProgressStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn save(&self, key: &str, progress: &BackfillProgress) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(progress)?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(PROGRESS_TTL_SECS)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<BackfillProgress>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_progress_serializes_camel_case() {
        let progress = BackfillProgress::new(Uuid::new_v4());
        let value = serde_json::to_value(&progress).unwrap();
        assert!(value.get("totalCustomers").is_some());
        assert!(value.get("importedEvents").is_some());
        assert!(value.get("estimatedSecondsRemaining").is_some());
        assert!(value.get("processingRatePerSecond").is_some());
        assert_eq!(value["status"], "queued");
    }

    #[test]
    fn test_rate_and_eta() {
        let mut progress = BackfillProgress::new(Uuid::new_v4());
        progress.total_customers = 100;
        progress.imported_customers = 50;
        progress.update_rate(25.0);
        assert!((progress.processing_rate_per_second - 2.0).abs() < 1e-9);
        assert_eq!(progress.estimated_seconds_remaining, Some(25));
    }

    #[test]
    fn test_eta_floor_on_stall() {
        let mut progress = BackfillProgress::new(Uuid::new_v4());
        progress.total_events = 10;
        progress.update_rate(0.0);
        // remaining / 0.1
        assert_eq!(progress.estimated_seconds_remaining, Some(100));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryProgressStore::new();
        let key = progress_key(Source::Stripe, Uuid::new_v4());
        assert!(store.load(&key).await.unwrap().is_none());

        let progress = BackfillProgress::new(Uuid::new_v4());
        store.save(&key, &progress).await.unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.job_id, progress.job_id);
    }
}
