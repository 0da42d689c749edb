//! Cross-platform conflicts: the same (user, product) looks different
//! depending on which store you ask.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{
    AccessClass, CanonicalEvent, DetectedIssue, DetectionTier, IssueSeverity, IssueType, Source,
};

use crate::error::Result;
use crate::Detector;

const MISMATCH_CONFIDENCE: f64 = 0.88;
const DUPLICATE_CONFIDENCE: f64 = 0.8;

pub struct CrossPlatformConflict;

#[async_trait]
impl Detector for CrossPlatformConflict {
    fn id(&self) -> &'static str {
        "cross_platform_conflict"
    }

    fn name(&self) -> &'static str {
        "Cross-platform conflict"
    }

    fn description(&self) -> &'static str {
        "Entitlements disagreeing across billing sources for the same product"
    }

    async fn check_event(
        &self,
        store: &dyn Store,
        org_id: Uuid,
        user_id: Option<Uuid>,
        event: &CanonicalEvent,
    ) -> Result<Vec<DetectedIssue>> {
        let Some(user_id) = user_id else {
            return Ok(Vec::new());
        };

        let entitlements = store
            .list_entitlements_for_user_product(org_id, user_id, event.product_id)
            .await?;
        if entitlements.len() < 2 {
            return Ok(Vec::new());
        }

        let granted: Vec<Source> = entitlements
            .iter()
            .filter(|e| e.state.access_class() == AccessClass::AccessGranted)
            .map(|e| e.source)
            .collect();
        let denied: Vec<Source> = entitlements
            .iter()
            .filter(|e| e.state.access_class() == AccessClass::NoAccess)
            .map(|e| e.source)
            .collect();

        let mut found = Vec::new();

        if !granted.is_empty() && !denied.is_empty() {
            found.push(DetectedIssue {
                user_id: Some(user_id),
                issue_type: IssueType::CrossPlatformMismatch,
                severity: IssueSeverity::Critical,
                title: "Entitlement state disagrees across platforms".to_string(),
                description: format!(
                    "Access is granted via {} but terminated via {}. One side is stale \
                     or a revocation never propagated.",
                    names(&granted),
                    names(&denied)
                ),
                estimated_revenue_cents: entitlements
                    .iter()
                    .find_map(|e| e.plan_amount_cents),
                confidence: MISMATCH_CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::BillingOnly,
                evidence: json!({
                    "grantedSources": granted.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                    "deniedSources": denied.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                }),
                scope_key: None,
            });
        }

        let distinct_granted: HashSet<Source> = granted.iter().copied().collect();
        if distinct_granted.len() >= 2 {
            found.push(DetectedIssue {
                user_id: Some(user_id),
                issue_type: IssueType::DuplicateSubscription,
                severity: IssueSeverity::Warning,
                title: "Active subscriptions on multiple platforms".to_string(),
                description: format!(
                    "The same product is actively subscribed via {}. The user is \
                     probably double-paying.",
                    names(&granted)
                ),
                estimated_revenue_cents: entitlements
                    .iter()
                    .filter(|e| e.state.access_class() == AccessClass::AccessGranted)
                    .find_map(|e| e.plan_amount_cents),
                confidence: DUPLICATE_CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::BillingOnly,
                evidence: json!({
                    "grantedSources": granted.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                }),
                scope_key: None,
            });
        }

        Ok(found)
    }
}

fn names(sources: &[Source]) -> String {
    sources
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
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
            current_period_start: None,
            current_period_end: None,
            cancel_at: None,
            trial_end: None,
            plan_amount_cents: Some(1999),
            state_history: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn any_event(org: Uuid) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: org,
            source: Source::Apple,
            source_event_type: "EXPIRED".into(),
            event_type: CanonicalEventType::Expiration,
            event_time: Utc::now(),
            status: EventStatus::Success,
            user_id: None,
            product_id: None,
            external_subscription_id: None,
            external_event_id: None,
            idempotency_key: "apple:x".into(),
            amount_cents: None,
            currency: None,
            period_type: None,
            expiration_time: None,
            cancellation_reason: None,
            environment: Environment::Production,
            raw_payload: serde_json::json!({}),
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_two_active_sources_is_duplicate_subscription() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Stripe, EntitlementState::Active))
            .await
            .unwrap();
        store
            .upsert_entitlement(entitlement(org, user, Source::Apple, EntitlementState::Active))
            .await
            .unwrap();

        let found = CrossPlatformConflict
            .check_event(store.as_ref(), org, Some(user), &any_event(org))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::DuplicateSubscription);
        assert_eq!(found[0].severity, IssueSeverity::Warning);
    }

    #[tokio::test]
    async fn test_granted_vs_no_access_is_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Stripe, EntitlementState::Active))
            .await
            .unwrap();
        store
            .upsert_entitlement(entitlement(org, user, Source::Apple, EntitlementState::Expired))
            .await
            .unwrap();

        let found = CrossPlatformConflict
            .check_event(store.as_ref(), org, Some(user), &any_event(org))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].issue_type, IssueType::CrossPlatformMismatch);
        assert_eq!(found[0].severity, IssueSeverity::Critical);
    }

    #[tokio::test]
    async fn test_single_entitlement_never_emits() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, Source::Stripe, EntitlementState::Active))
            .await
            .unwrap();

        let found = CrossPlatformConflict
            .check_event(store.as_ref(), org, Some(user), &any_event(org))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
