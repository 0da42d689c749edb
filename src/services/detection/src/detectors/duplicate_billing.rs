//! Duplicate billing: a purchase or renewal lands while an active
//! entitlement for the same (user, product) already exists on a different
//! source with an overlapping period.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, DetectedIssue, DetectionTier, IssueSeverity, IssueType,
};

use crate::error::Result;
use crate::Detector;

const CONFIDENCE: f64 = 0.9;

pub struct DuplicateBilling;

#[async_trait]
impl Detector for DuplicateBilling {
    fn id(&self) -> &'static str {
        "duplicate_billing"
    }

    fn name(&self) -> &'static str {
        "Duplicate billing"
    }

    fn description(&self) -> &'static str {
        "Charges for the same product arriving from more than one billing source"
    }

    async fn check_event(
        &self,
        store: &dyn Store,
        org_id: Uuid,
        user_id: Option<Uuid>,
        event: &CanonicalEvent,
    ) -> Result<Vec<DetectedIssue>> {
        if !matches!(
            event.event_type,
            CanonicalEventType::Purchase | CanonicalEventType::Renewal
        ) {
            return Ok(Vec::new());
        }
        let Some(user_id) = user_id else {
            return Ok(Vec::new());
        };

        let entitlements = store
            .list_entitlements_for_user_product(org_id, user_id, event.product_id)
            .await?;

        let overlapping: Vec<_> = entitlements
            .iter()
            .filter(|e| e.source != event.source && e.state.grants_access())
            .filter(|e| {
                // Overlap: the other source's period reaches past this
                // event's moment (or has no recorded end yet)
                e.current_period_end
                    .map(|end| end > event.event_time)
                    .unwrap_or(true)
            })
            .collect();

        if overlapping.is_empty() {
            return Ok(Vec::new());
        }

        let other_sources: Vec<&str> = overlapping.iter().map(|e| e.source.as_str()).collect();
        let estimated = event.amount_cents.or_else(|| {
            overlapping.iter().find_map(|e| e.plan_amount_cents)
        });

        Ok(vec![DetectedIssue {
            user_id: Some(user_id),
            issue_type: IssueType::DuplicateBilling,
            severity: IssueSeverity::Critical,
            title: format!(
                "User billed on {} while already subscribed via {}",
                event.source,
                other_sources.join(", ")
            ),
            description: format!(
                "A {} event arrived from {} but an active entitlement for the same \
                 product exists on {}. The user is likely paying twice.",
                event.event_type, event.source, other_sources.join(", ")
            ),
            estimated_revenue_cents: estimated,
            confidence: CONFIDENCE,
            detector_id: self.id().to_string(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: json!({
                "triggeringSource": event.source.as_str(),
                "triggeringEvent": event.event_type.as_str(),
                "overlappingSources": other_sources,
                "amountCents": event.amount_cents,
            }),
            scope_key: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use revwatch_database::MemoryStore;
    use revwatch_shared::*;
    use std::sync::Arc;

    fn entitlement(org: Uuid, user: Uuid, source: Source, state: EntitlementState) -> Entitlement {
        Entitlement {
            id: Uuid::new_v4(),
            org_id: org,
            user_id: user,
            product_id: None,
            source,
            state,
            current_period_start: Some(Utc::now() - Duration::days(10)),
            current_period_end: Some(Utc::now() + Duration::days(20)),
            cancel_at: None,
            trial_end: None,
            plan_amount_cents: Some(1999),
            state_history: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn renewal(org: Uuid, source: Source) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: org,
            source,
            source_event_type: "renewal".into(),
            event_type: CanonicalEventType::Renewal,
            event_time: Utc::now(),
            status: EventStatus::Success,
            user_id: None,
            product_id: None,
            external_subscription_id: None,
            external_event_id: None,
            idempotency_key: format!("{}:r", source),
            amount_cents: Some(1999),
            currency: Some("usd".into()),
            period_type: None,
            expiration_time: None,
            cancellation_reason: None,
            environment: Environment::Production,
            raw_payload: serde_json::json!({}),
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emits_on_cross_source_overlap() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Apple, EntitlementState::Active))
            .await
            .unwrap();

        let found = DuplicateBilling
            .check_event(store.as_ref(), org, Some(user), &renewal(org, Source::Stripe))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::DuplicateBilling);
        assert_eq!(found[0].severity, IssueSeverity::Critical);
    }

    #[tokio::test]
    async fn test_same_source_does_not_emit() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Stripe, EntitlementState::Active))
            .await
            .unwrap();

        let found = DuplicateBilling
            .check_event(store.as_ref(), org, Some(user), &renewal(org, Source::Stripe))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_expired_other_source_does_not_emit() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Apple, EntitlementState::Expired))
            .await
            .unwrap();

        let found = DuplicateBilling
            .check_event(store.as_ref(), org, Some(user), &renewal(org, Source::Stripe))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
