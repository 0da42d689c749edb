//! Distributed advisory locks
//!
//! `backfill-lock:{source}:{org_id}` is taken with SET NX and a TTL so a
//! crashed runner auto-releases within the lease. The guard releases on
//! every exit path, including panic and task cancellation, by spawning
//! the release from `Drop`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock; `false` when someone else holds it
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<()>;
}

/// RAII lease: dropping the guard releases the lock
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub async fn try_acquire(
        manager: Arc<dyn LockManager>,
        key: String,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        if manager.acquire(&key, ttl).await? {
            Ok(Some(Self {
                manager,
                key,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let manager = self.manager.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.release(&key).await {
                    warn!(key = %key, error = %err, "failed to release lock on drop");
                }
            });
        }
    }
}

/// In-process lock manager for dev mode and tests
#[derive(Default)]
pub struct MemoryLockManager {
    locks: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get(key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                locks.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.locks.lock().await.remove(key);
        Ok(())
    }
}

/// Redis SET NX EX lock
pub struct RedisLockManager {
    conn: ConnectionManager,
}

impl RedisLockManager {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_excludes_second_holder() {
        let manager: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let guard = LockGuard::try_acquire(
            manager.clone(),
            "backfill-lock:stripe:org".into(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(guard.is_some());

        let second = LockGuard::try_acquire(
            manager.clone(),
            "backfill-lock:stripe:org".into(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(second.is_none());

        guard.unwrap().release().await.unwrap();
        let third = LockGuard::try_acquire(
            manager,
            "backfill-lock:stripe:org".into(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reacquirable() {
        let manager = MemoryLockManager::new();
        assert!(manager
            .acquire("k", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager
            .acquire("k", Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let manager: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        {
            let _guard = LockGuard::try_acquire(
                manager.clone(),
                "k".into(),
                Duration::from_secs(60),
            )
            .await
            .unwrap()
            .unwrap();
        }
        // Release happens on a spawned task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.acquire("k", Duration::from_secs(60)).await.unwrap());
    }
}
