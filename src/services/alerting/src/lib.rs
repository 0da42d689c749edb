//! Alert dispatch
//!
//! New and transitioned issues fan out to every active alert config whose
//! event-type filter admits them. Deliveries run on a bounded worker pool
//! so a slow endpoint cannot stall the pipeline; outbound webhooks retry
//! with exponential backoff and dead-letter into the audit log. Delivery
//! is at-least-once — receivers dedupe on the delivery id.

pub mod channels;
pub mod dispatcher;
pub mod error;

pub use dispatcher::{AlertDispatcher, DispatcherConfig};
pub use error::{AlertError, Result};
