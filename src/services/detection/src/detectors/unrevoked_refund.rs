//! Unrevoked refund: money went back to the user but their entitlement
//! still grants (or is about to regain) access.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{
    AccessClass, CanonicalEvent, CanonicalEventType, DetectedIssue, DetectionTier, IssueSeverity,
    IssueType,
};

use crate::error::Result;
use crate::Detector;

const REFUND_CONFIDENCE: f64 = 0.92;
const CHARGEBACK_CONFIDENCE: f64 = 0.95;

pub struct UnrevokedRefund;

#[async_trait]
impl Detector for UnrevokedRefund {
    fn id(&self) -> &'static str {
        "unrevoked_refund"
    }

    fn name(&self) -> &'static str {
        "Unrevoked refund"
    }

    fn description(&self) -> &'static str {
        "Refunded or disputed payments whose entitlement was never revoked"
    }

    async fn check_event(
        &self,
        store: &dyn Store,
        org_id: Uuid,
        user_id: Option<Uuid>,
        event: &CanonicalEvent,
    ) -> Result<Vec<DetectedIssue>> {
        let is_chargeback = match event.event_type {
            CanonicalEventType::Refund => false,
            CanonicalEventType::Chargeback => true,
            _ => return Ok(Vec::new()),
        };
        let Some(user_id) = user_id else {
            return Ok(Vec::new());
        };

        let entitlements = store
            .list_entitlements_for_user_product(org_id, user_id, event.product_id)
            .await?;
        let still_entitled: Vec<_> = entitlements
            .iter()
            .filter(|e| {
                matches!(
                    e.state.access_class(),
                    AccessClass::AccessGranted | AccessClass::AtRisk
                )
            })
            .collect();

        if still_entitled.is_empty() {
            return Ok(Vec::new());
        }

        let kind = if is_chargeback { "chargeback" } else { "refund" };
        let states: Vec<&str> = still_entitled.iter().map(|e| e.state.as_str()).collect();

        Ok(vec![DetectedIssue {
            user_id: Some(user_id),
            issue_type: IssueType::UnrevokedRefund,
            severity: if is_chargeback {
                IssueSeverity::Critical
            } else {
                IssueSeverity::Warning
            },
            title: format!("Access not revoked after {}", kind),
            description: format!(
                "A {} was processed on {} but the user's entitlement is still in \
                 state {}. The user keeps access without paying.",
                kind,
                event.source,
                states.join(", ")
            ),
            estimated_revenue_cents: event.amount_cents,
            confidence: if is_chargeback {
                CHARGEBACK_CONFIDENCE
            } else {
                REFUND_CONFIDENCE
            },
            detector_id: self.id().to_string(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: json!({
                "eventType": event.event_type.as_str(),
                "source": event.source.as_str(),
                "entitlementStates": states,
                "amountCents": event.amount_cents,
            }),
            scope_key: None,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use revwatch_database::MemoryStore;
    use revwatch_shared::*;
    use std::sync::Arc;

    fn entitlement(org: Uuid, user: Uuid, state: EntitlementState) -> Entitlement {
        Entitlement {
            id: Uuid::new_v4(),
            org_id: org,
            user_id: user,
            product_id: None,
            source: Source::Stripe,
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

    fn event(org: Uuid, event_type: CanonicalEventType) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: org,
            source: Source::Stripe,
            source_event_type: "charge.refunded".into(),
            event_type,
            event_time: Utc::now(),
            status: EventStatus::Refunded,
            user_id: None,
            product_id: None,
            external_subscription_id: None,
            external_event_id: None,
            idempotency_key: "stripe:x".into(),
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
    async fn test_refund_with_active_entitlement_emits_warning() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, EntitlementState::Active))
            .await
            .unwrap();

        let found = UnrevokedRefund
            .check_event(
                store.as_ref(),
                org,
                Some(user),
                &event(org, CanonicalEventType::Refund),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, IssueSeverity::Warning);
        assert_eq!(found[0].estimated_revenue_cents, Some(1999));
        assert!((found[0].confidence - 0.92).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_chargeback_is_critical() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, EntitlementState::BillingRetry))
            .await
            .unwrap();

        let found = UnrevokedRefund
            .check_event(
                store.as_ref(),
                org,
                Some(user),
                &event(org, CanonicalEventType::Chargeback),
            )
            .await
            .unwrap();
        assert_eq!(found[0].severity, IssueSeverity::Critical);
    }

    #[tokio::test]
    async fn test_refunded_entitlement_does_not_emit() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .upsert_entitlement(entitlement(org, user, EntitlementState::Refunded))
            .await
            .unwrap();

        let found = UnrevokedRefund
            .check_event(
                store.as_ref(),
                org,
                Some(user),
                &event(org, CanonicalEventType::Refund),
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
