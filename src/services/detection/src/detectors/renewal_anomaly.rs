//! Renewal anomaly: the rolling 24 h renewal failure rate runs more than
//! three standard deviations above the preceding week's baseline.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{
    CanonicalEventType, DetectedIssue, DetectionTier, EventStatus, IssueSeverity, IssueType,
};

use crate::error::Result;
use crate::Detector;

const CONFIDENCE: f64 = 0.7;
const BASELINE_DAYS: i64 = 7;

pub struct RenewalAnomaly {
    /// Minimum renewal attempts in the window before the rate means anything
    min_attempts: u64,
}

impl Default for RenewalAnomaly {
    fn default() -> Self {
        Self { min_attempts: 10 }
    }
}

#[async_trait]
impl Detector for RenewalAnomaly {
    fn id(&self) -> &'static str {
        "renewal_anomaly"
    }

    fn name(&self) -> &'static str {
        "Renewal anomaly"
    }

    fn description(&self) -> &'static str {
        "Renewal failure rate spiking above the weekly baseline"
    }

    async fn scheduled_scan(&self, store: &dyn Store, org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        let now = Utc::now();

        let current = failure_rate(store, org_id, now - Duration::hours(24), now).await?;
        let Some((rate, attempts)) = current else {
            return Ok(Vec::new());
        };
        if attempts < self.min_attempts {
            return Ok(Vec::new());
        }

        // Daily failure rates for the 7 days preceding the current window
        let mut baseline = Vec::with_capacity(BASELINE_DAYS as usize);
        for day in 1..=BASELINE_DAYS {
            let until = now - Duration::hours(24 * day);
            let since = until - Duration::hours(24);
            if let Some((day_rate, _)) = failure_rate(store, org_id, since, until).await? {
                baseline.push(day_rate);
            }
        }
        if baseline.len() < 3 {
            return Ok(Vec::new());
        }

        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let variance = baseline
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / baseline.len() as f64;
        let sigma = variance.sqrt();

        let threshold = mean + 3.0 * sigma;
        if rate <= threshold {
            return Ok(Vec::new());
        }

        Ok(vec![DetectedIssue {
            user_id: None,
            issue_type: IssueType::RenewalAnomaly,
            severity: IssueSeverity::Warning,
            title: format!(
                "Renewal failure rate at {:.0}% (baseline {:.0}%)",
                rate * 100.0,
                mean * 100.0
            ),
            description: format!(
                "{:.1}% of the last 24 hours' renewal attempts failed, against a \
                 weekly baseline of {:.1}% \u{00b1} {:.1}%. Something systemic is \
                 rejecting charges.",
                rate * 100.0,
                mean * 100.0,
                sigma * 100.0
            ),
            estimated_revenue_cents: None,
            confidence: CONFIDENCE,
            detector_id: self.id().to_string(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: json!({
                "failureRate": rate,
                "baselineMean": mean,
                "baselineSigma": sigma,
                "attempts24h": attempts,
            }),
            scope_key: Some("renewals".to_string()),
        }])
    }
}

/// (failure rate, total attempts) for the window, `None` when idle
async fn failure_rate(
    store: &dyn Store,
    org_id: Uuid,
    since: chrono::DateTime<Utc>,
    until: chrono::DateTime<Utc>,
) -> Result<Option<(f64, u64)>> {
    let succeeded = store
        .count_events_by_type_status(org_id, CanonicalEventType::Renewal, EventStatus::Success, since, until)
        .await?;
    let failed = store
        .count_events_by_type_status(
            org_id,
            CanonicalEventType::BillingRetry,
            EventStatus::Failed,
            since,
            until,
        )
        .await?;
    let total = succeeded + failed;
    if total == 0 {
        return Ok(None);
    }
    Ok(Some((failed as f64 / total as f64, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use revwatch_database::MemoryStore;
    use revwatch_shared::*;
    use std::sync::Arc;

    async fn seed_events(
        store: &MemoryStore,
        org: Uuid,
        hours_ago: i64,
        renewals: usize,
        failures: usize,
    ) {
        let at = Utc::now() - Duration::hours(hours_ago);
        for i in 0..renewals {
            store
                .insert_canonical_event(event(org, at, CanonicalEventType::Renewal, EventStatus::Success, &format!("r{}-{}", hours_ago, i)))
                .await
                .unwrap();
        }
        for i in 0..failures {
            store
                .insert_canonical_event(event(org, at, CanonicalEventType::BillingRetry, EventStatus::Failed, &format!("f{}-{}", hours_ago, i)))
                .await
                .unwrap();
        }
    }

    fn event(
        org: Uuid,
        at: chrono::DateTime<Utc>,
        event_type: CanonicalEventType,
        status: EventStatus,
        key: &str,
    ) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: org,
            source: Source::Stripe,
            source_event_type: "invoice".into(),
            event_type,
            event_time: at,
            status,
            user_id: None,
            product_id: None,
            external_subscription_id: None,
            external_event_id: None,
            idempotency_key: format!("stripe:{}", key),
            amount_cents: Some(1999),
            currency: Some("usd".into()),
            period_type: None,
            expiration_time: None,
            cancellation_reason: None,
            environment: Environment::Production,
            raw_payload: serde_json::json!({}),
            ingested_at: at,
        }
    }

    #[tokio::test]
    async fn test_spike_over_stable_baseline_emits() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        // Seven clean days, then a day of heavy failures
        for day in 1..=7 {
            seed_events(&store, org, 24 * day + 1, 20, 0).await;
        }
        seed_events(&store, org, 1, 5, 15).await;

        let found = RenewalAnomaly::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::RenewalAnomaly);
        assert_eq!(found[0].scope_key.as_deref(), Some("renewals"));
    }

    #[tokio::test]
    async fn test_steady_rate_does_not_emit() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        for day in 0..=7 {
            seed_events(&store, org, 24 * day + 1, 18, 2).await;
        }

        let found = RenewalAnomaly::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_low_volume_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        for day in 1..=7 {
            seed_events(&store, org, 24 * day + 1, 5, 0).await;
        }
        seed_events(&store, org, 1, 1, 3).await;

        let found = RenewalAnomaly::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
