//! Ingestion pipeline
//!
//! The path from accepted webhook bytes to canonical events, entitlement
//! transitions, and event-triggered detection:
//!
//! - [`queue`] — the durable work queue between receiver and workers
//!   (Redis list in production, in-process fallback without `REDIS_URL`)
//! - [`identity`] — canonical user resolution from normalizer hints
//! - [`entitlement`] — the per (user, product, source) state machine
//! - [`pipeline`] — the worker: normalize, idempotency gate, identity
//!   resolve, persist, transition, detect

pub mod entitlement;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod queue;

pub use entitlement::EntitlementEngine;
pub use error::{IngestionError, Result};
pub use identity::IdentityResolver;
pub use pipeline::IngestionPipeline;
pub use queue::{JobQueue, MemoryQueue, RedisQueue, WebhookJob};
