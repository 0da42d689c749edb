//! Shared types and utilities for the RevWatch platform
//!
//! Every service crate depends on this one for the canonical event model,
//! the entitlement state vocabulary, tenant-scoped entity definitions,
//! environment configuration, and payload sanitization.

pub mod config;
pub mod sanitize;
pub mod types;

pub use config::{AppConfig, ConfigError, ServerConfig, WorkerConfig};
pub use types::*;
