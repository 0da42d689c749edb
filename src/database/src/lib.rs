//! Storage layer for the RevWatch platform
//!
//! All persistence flows through the [`Store`] contract. Two
//! implementations ship:
//! - [`PgStore`] — PostgreSQL via sqlx, the production store
//! - [`MemoryStore`] — an in-process store with identical semantics, used
//!   by the test suite and as the contract's executable specification
//!
//! Every method is tenant-scoped: it either takes an `org_id` or operates
//! on a value that carries one, and no implementation may return rows
//! belonging to another tenant.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{DatabaseError, Result};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    ConnectionHealth, InsertOutcome, IssueFilter, IssueSummary, Store, WebhookLogFilter,
};
