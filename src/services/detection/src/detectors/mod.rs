//! The registered detector set
//!
//! Tier 1 (`billing_only`) detectors work from provider data alone; tier 2
//! (`app_verified`) detectors additionally need access-check ingestion
//! from the customer application.

pub mod cross_platform;
pub mod data_freshness;
pub mod duplicate_billing;
pub mod renewal_anomaly;
pub mod unrevoked_refund;
pub mod verified_access;
pub mod webhook_gap;
