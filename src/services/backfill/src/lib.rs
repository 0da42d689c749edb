//! Backfill engine
//!
//! Imports historical subscriptions and events from a provider and
//! replays synthesized, provider-shaped payloads through the ingestion
//! pipeline's trusted entry point. Runs are serialized by a distributed
//! lock, report progress under a 24 h TTL, and honor a cancellation flag
//! between pages. Idempotency keys of synthesized payloads carry a
//! per-run suffix so a later live delivery of the same provider event is
//! a fresh insert, never a collision.

pub mod engine;
pub mod error;
pub mod lock;
pub mod progress;
pub mod providers;

pub use engine::{BackfillEngine, BackfillParams};
pub use error::{BackfillError, Result};
pub use lock::{LockManager, MemoryLockManager, RedisLockManager};
pub use progress::{
    BackfillPhase, BackfillProgress, BackfillStatus, MemoryProgressStore, ProgressStore,
    RedisProgressStore,
};
