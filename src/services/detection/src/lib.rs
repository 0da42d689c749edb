//! Detection engine
//!
//! An ordered registry of detectors runs against the tenant's data, either
//! synchronously with event ingestion (`check_event`) or on the scheduler
//! (`scheduled_scan`). The engine owns open-issue deduplication, failure
//! isolation (a panicking detector never blocks ingestion or its peers),
//! and alert fan-out through an [`AlertSink`].

pub mod detectors;
pub mod engine;
pub mod error;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{AlertEventType, CanonicalEvent, DetectedIssue, DetectionTier, Issue};

pub use engine::DetectionEngine;
pub use error::{DetectionError, Result};

/// A registered detector. Implement `check_event`, `scheduled_scan`, or
/// both; the default bodies make the other mode a no-op.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Stable identifier written onto every emitted issue
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn tier(&self) -> DetectionTier {
        DetectionTier::BillingOnly
    }

    /// Pure read against the tenant, synchronous with the pipeline
    async fn check_event(
        &self,
        _store: &dyn Store,
        _org_id: Uuid,
        _user_id: Option<Uuid>,
        _event: &CanonicalEvent,
    ) -> Result<Vec<DetectedIssue>> {
        Ok(Vec::new())
    }

    /// Tenant-wide scan, invoked periodically
    async fn scheduled_scan(&self, _store: &dyn Store, _org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        Ok(Vec::new())
    }
}

/// Where newly created issues are announced. The alert dispatcher
/// implements this; tests use a recording stub.
pub trait AlertSink: Send + Sync {
    /// Fire-and-forget: implementations enqueue and return immediately
    fn notify(&self, org_id: Uuid, issue: &Issue, event_type: AlertEventType);
}

/// A sink that drops everything (engine without alerting wired up)
pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn notify(&self, _org_id: Uuid, _issue: &Issue, _event_type: AlertEventType) {}
}

/// The production registry: the eight detectors in their registration order
pub fn default_registry() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(detectors::duplicate_billing::DuplicateBilling),
        Arc::new(detectors::unrevoked_refund::UnrevokedRefund),
        Arc::new(detectors::cross_platform::CrossPlatformConflict),
        Arc::new(detectors::webhook_gap::WebhookDeliveryGap::default()),
        Arc::new(detectors::renewal_anomaly::RenewalAnomaly::default()),
        Arc::new(detectors::data_freshness::DataFreshness),
        Arc::new(detectors::verified_access::VerifiedPaidNoAccess),
        Arc::new(detectors::verified_access::VerifiedAccessNoPayment),
    ]
}
