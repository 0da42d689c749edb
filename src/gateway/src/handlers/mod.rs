//! HTTP handlers

pub mod access_checks;
pub mod admin;
pub mod backfill;
pub mod health;
pub mod issues;
pub mod setup;
pub mod users;
pub mod webhooks;
