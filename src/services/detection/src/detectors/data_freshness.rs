//! Data freshness: an entitlement whose billing period lapsed without any
//! update for twice its billing interval. The provider most likely sent
//! webhooks we never received.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{DetectedIssue, DetectionTier, IssueSeverity, IssueType};

use crate::error::Result;
use crate::Detector;

const CONFIDENCE: f64 = 0.7;
/// Assumed interval when an entitlement has no recorded period bounds
const FALLBACK_INTERVAL_DAYS: i64 = 30;

pub struct DataFreshness;

#[async_trait]
impl Detector for DataFreshness {
    fn id(&self) -> &'static str {
        "data_freshness"
    }

    fn name(&self) -> &'static str {
        "Data freshness"
    }

    fn description(&self) -> &'static str {
        "Entitlements gone silent past their billing period, suggesting lost webhooks"
    }

    async fn scheduled_scan(&self, store: &dyn Store, org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        let now = Utc::now();
        let mut found = Vec::new();

        for ent in store.list_entitlements_past_period_end(org_id, now).await? {
            let interval = match (ent.current_period_start, ent.current_period_end) {
                (Some(start), Some(end)) if end > start => end - start,
                _ => Duration::days(FALLBACK_INTERVAL_DAYS),
            };
            let silence = now - ent.updated_at;
            if silence < interval * 2 {
                continue;
            }

            found.push(DetectedIssue {
                user_id: Some(ent.user_id),
                issue_type: IssueType::StaleEntitlement,
                severity: IssueSeverity::Warning,
                title: format!(
                    "{} entitlement silent for {} days past its period",
                    ent.source,
                    silence.num_days()
                ),
                description: format!(
                    "The {} entitlement's period ended {} but nothing has updated it \
                     in {} days (over twice its {}-day billing interval). A renewal \
                     or expiration webhook was probably lost.",
                    ent.source,
                    ent.current_period_end
                        .map(|end| end.to_rfc3339())
                        .unwrap_or_default(),
                    silence.num_days(),
                    interval.num_days().max(1)
                ),
                estimated_revenue_cents: ent.plan_amount_cents,
                confidence: CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::BillingOnly,
                evidence: json!({
                    "source": ent.source.as_str(),
                    "state": ent.state.as_str(),
                    "currentPeriodEnd": ent.current_period_end.map(|end| end.to_rfc3339()),
                    "daysSinceUpdate": silence.num_days(),
                    "billingIntervalDays": interval.num_days(),
                }),
                scope_key: None,
            });
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revwatch_database::MemoryStore;
    use revwatch_shared::*;
    use std::sync::Arc;

    fn entitlement(
        org: Uuid,
        period_days: i64,
        period_ended_days_ago: i64,
        updated_days_ago: i64,
    ) -> Entitlement {
        let end = Utc::now() - Duration::days(period_ended_days_ago);
        Entitlement {
            id: Uuid::new_v4(),
            org_id: org,
            user_id: Uuid::new_v4(),
            product_id: None,
            source: Source::Stripe,
            state: EntitlementState::Active,
            current_period_start: Some(end - Duration::days(period_days)),
            current_period_end: Some(end),
            cancel_at: None,
            trial_end: None,
            plan_amount_cents: Some(1999),
            state_history: vec![],
            created_at: Utc::now() - Duration::days(90),
            updated_at: Utc::now() - Duration::days(updated_days_ago),
        }
    }

    #[tokio::test]
    async fn test_long_silence_emits() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        // 7-day interval, period ended 20 days ago, untouched for 20 days
        store
            .upsert_entitlement(entitlement(org, 7, 20, 20))
            .await
            .unwrap();

        let found = DataFreshness.scheduled_scan(store.as_ref(), org).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::StaleEntitlement);
    }

    #[tokio::test]
    async fn test_recent_update_does_not_emit() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        // Period lapsed yesterday but the row was touched two days ago
        store
            .upsert_entitlement(entitlement(org, 30, 1, 2))
            .await
            .unwrap();

        let found = DataFreshness.scheduled_scan(store.as_ref(), org).await.unwrap();
        assert!(found.is_empty());
    }
}
