//! Entitlement state machine
//!
//! One row per (org, user, product, source), created on the first event
//! touching the tuple and never destroyed. Transitions are a pure
//! function of (state, event); invalid transitions are no-ops so replays
//! and out-of-order deliveries stay safe. Per-row writes are serialized
//! through a keyed lease.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, Entitlement, EntitlementState, EntitlementTransition,
    EventStatus, PeriodType, Source,
};

use crate::error::Result;

/// What a single event did to the entitlement row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State changed (history appended)
    Transitioned,
    /// Fields updated without a state change (cancel_at, plan amount)
    Updated,
    /// Nothing to do for this (state, event) pair
    NoOp,
    /// The event would roll the period backwards; rejected and logged
    RejectedStalePeriod,
}

type RowKey = (Uuid, Uuid, Option<Uuid>, Source);

pub struct EntitlementEngine {
    store: Arc<dyn Store>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
}

impl EntitlementEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            row_locks: DashMap::new(),
        }
    }

    fn row_lock(&self, key: RowKey) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply a canonical event to the (user, product, source) entitlement
    pub async fn apply(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        event: &CanonicalEvent,
    ) -> Result<TransitionOutcome> {
        if !affects_entitlement(event.event_type) {
            return Ok(TransitionOutcome::NoOp);
        }

        let key = (org_id, user_id, event.product_id, event.source);
        let lock = self.row_lock(key);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut ent = match self
            .store
            .get_entitlement(org_id, user_id, event.product_id, event.source)
            .await?
        {
            Some(existing) => existing,
            None => Entitlement {
                id: Uuid::new_v4(),
                org_id,
                user_id,
                product_id: event.product_id,
                source: event.source,
                state: EntitlementState::Inactive,
                current_period_start: None,
                current_period_end: None,
                cancel_at: None,
                trial_end: None,
                plan_amount_cents: None,
                state_history: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        };

        // Period monotonicity inside the active series: an event carrying
        // an older period end than the row already has is stale
        if let (Some(incoming), Some(current)) = (event.expiration_time, ent.current_period_end) {
            let renewing = matches!(
                event.event_type,
                CanonicalEventType::Purchase
                    | CanonicalEventType::Renewal
                    | CanonicalEventType::TrialConversion
            );
            if renewing && ent.state.grants_access() && incoming < current {
                warn!(
                    entitlement = %ent.id,
                    incoming = %incoming,
                    current = %current,
                    "rejecting stale period rollback"
                );
                return Ok(TransitionOutcome::RejectedStalePeriod);
            }
        }

        let decision = transition(ent.state, event);
        let outcome = match decision {
            Decision::Move(next) => {
                ent.state_history.push(EntitlementTransition {
                    from: ent.state,
                    to: next,
                    event_id: Some(event.id),
                    at: now,
                });
                ent.state = next;
                apply_fields(&mut ent, event);
                TransitionOutcome::Transitioned
            }
            Decision::UpdateOnly => {
                apply_fields(&mut ent, event);
                TransitionOutcome::Updated
            }
            Decision::Ignore => {
                debug!(
                    state = ent.state.as_str(),
                    event_type = event.event_type.as_str(),
                    "no valid transition, ignoring"
                );
                // Still persist a newly touched tuple so the row exists
                if ent.state_history.is_empty() && ent.updated_at == now {
                    self.store.upsert_entitlement(ent).await?;
                }
                return Ok(TransitionOutcome::NoOp);
            }
        };

        ent.updated_at = now;
        self.store.upsert_entitlement(ent).await?;
        Ok(outcome)
    }
}

fn affects_entitlement(event_type: CanonicalEventType) -> bool {
    !matches!(
        event_type,
        CanonicalEventType::OfferRedeemed | CanonicalEventType::PriceChange
    )
}

enum Decision {
    Move(EntitlementState),
    UpdateOnly,
    Ignore,
}

/// The transition table. Events not matching their guard are ignored.
fn transition(state: EntitlementState, event: &CanonicalEvent) -> Decision {
    use CanonicalEventType::*;
    use EntitlementState as S;

    match event.event_type {
        Purchase => {
            let target = if event.period_type == Some(PeriodType::Trial) {
                S::Trial
            } else {
                S::Active
            };
            if state == target {
                Decision::UpdateOnly
            } else {
                Decision::Move(target)
            }
        }
        TrialConversion => match state {
            S::Trial => Decision::Move(S::Active),
            _ => Decision::Ignore,
        },
        Renewal if event.status == EventStatus::Success => match state {
            S::Active => Decision::UpdateOnly,
            S::GracePeriod | S::BillingRetry => Decision::Move(S::Active),
            _ => Decision::Ignore,
        },
        Renewal => Decision::Ignore,
        BillingRetry if event.status == EventStatus::Failed => match state {
            S::Active => Decision::Move(S::BillingRetry),
            _ => Decision::Ignore,
        },
        BillingRetry => Decision::Ignore,
        GracePeriodStart => match state {
            S::Active | S::BillingRetry => Decision::Move(S::GracePeriod),
            _ => Decision::Ignore,
        },
        GracePeriodEnd if event.status == EventStatus::Failed => match state {
            S::GracePeriod => Decision::Move(S::Expired),
            _ => Decision::Ignore,
        },
        GracePeriodEnd => Decision::Ignore,
        Cancellation => match state {
            // State holds until the period actually ends
            S::Active | S::Trial => Decision::UpdateOnly,
            _ => Decision::Ignore,
        },
        Expiration => match (event.status, state) {
            (EventStatus::Success, S::Active | S::Trial | S::GracePeriod) => {
                Decision::Move(S::Expired)
            }
            (EventStatus::Failed, S::BillingRetry | S::GracePeriod) => Decision::Move(S::Expired),
            _ => Decision::Ignore,
        },
        // Store-platform refunds revoke access; card-rail refunds move
        // money only, the subscription stays live until the provider
        // sends its own cancellation or revoke (the gap between the two
        // is what the unrevoked-refund detector flags)
        Refund => match event.source {
            Source::Apple | Source::Google => match state {
                S::Refunded => Decision::Ignore,
                _ => Decision::Move(S::Refunded),
            },
            Source::Stripe | Source::Recurly | Source::Braintree => Decision::Ignore,
        },
        Revoke => match state {
            S::Revoked => Decision::Ignore,
            _ => Decision::Move(S::Revoked),
        },
        Pause => match state {
            S::Active => Decision::Move(S::Paused),
            _ => Decision::Ignore,
        },
        Resume => match state {
            // refunded and revoked are sticky until purchase or resume
            S::Paused | S::Refunded | S::Revoked => Decision::Move(S::Active),
            _ => Decision::Ignore,
        },
        Upgrade | Downgrade => match state {
            S::Active => Decision::UpdateOnly,
            _ => Decision::Ignore,
        },
        OfferRedeemed | PriceChange => Decision::Ignore,
    }
}

fn apply_fields(ent: &mut Entitlement, event: &CanonicalEvent) {
    use CanonicalEventType::*;

    match event.event_type {
        Purchase | Renewal | TrialConversion | Resume => {
            ent.current_period_start = Some(event.event_time);
            if event.expiration_time.is_some() {
                ent.current_period_end = event.expiration_time;
            }
            ent.cancel_at = None;
            if let Some(amount) = event.amount_cents {
                ent.plan_amount_cents = Some(amount);
            }
            if event.period_type == Some(PeriodType::Trial) {
                ent.trial_end = event.expiration_time;
            }
        }
        Cancellation => {
            ent.cancel_at = event
                .expiration_time
                .or(ent.current_period_end)
                .or(Some(event.event_time));
        }
        Upgrade | Downgrade => {
            if let Some(amount) = event.amount_cents {
                ent.plan_amount_cents = Some(amount);
            }
            if event.expiration_time.is_some() {
                ent.current_period_end = event.expiration_time;
            }
        }
        GracePeriodStart => {
            if event.expiration_time.is_some() {
                ent.current_period_end = event.expiration_time;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use revwatch_database::MemoryStore;
    use serde_json::json;

    fn engine() -> (Arc<MemoryStore>, EntitlementEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = EntitlementEngine::new(store.clone());
        (store, engine)
    }

    fn event(
        org: Uuid,
        event_type: CanonicalEventType,
        status: EventStatus,
        key: &str,
    ) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: org,
            source: Source::Stripe,
            source_event_type: "test".into(),
            event_type,
            event_time: Utc::now(),
            status,
            user_id: None,
            product_id: None,
            external_subscription_id: Some("sub_1".into()),
            external_event_id: None,
            idempotency_key: format!("stripe:{}", key),
            amount_cents: Some(1999),
            currency: Some("usd".into()),
            period_type: None,
            expiration_time: Some(Utc::now() + Duration::days(30)),
            cancellation_reason: None,
            environment: revwatch_shared::Environment::Production,
            raw_payload: json!({}),
            ingested_at: Utc::now(),
        }
    }

    async fn state(store: &MemoryStore, org: Uuid, user: Uuid) -> EntitlementState {
        store
            .get_entitlement(org, user, None, Source::Stripe)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn test_purchase_creates_active_entitlement() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let outcome = engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Transitioned);
        assert_eq!(state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_trial_purchase_then_conversion() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut purchase = event(org, CanonicalEventType::Purchase, EventStatus::Success, "p");
        purchase.period_type = Some(PeriodType::Trial);
        engine.apply(org, user, &purchase).await.unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::Trial);

        engine
            .apply(
                org,
                user,
                &event(org, CanonicalEventType::TrialConversion, EventStatus::Success, "t"),
            )
            .await
            .unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_billing_retry_then_recovery() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        engine
            .apply(
                org,
                user,
                &event(org, CanonicalEventType::BillingRetry, EventStatus::Failed, "f"),
            )
            .await
            .unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::BillingRetry);

        let mut recovery = event(org, CanonicalEventType::Renewal, EventStatus::Success, "r");
        recovery.expiration_time = Some(Utc::now() + Duration::days(60));
        engine.apply(org, user, &recovery).await.unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_state_sets_cancel_at() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        engine
            .apply(
                org,
                user,
                &event(org, CanonicalEventType::Cancellation, EventStatus::Success, "c"),
            )
            .await
            .unwrap();

        let ent = store
            .get_entitlement(org, user, None, Source::Stripe)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ent.state, EntitlementState::Active);
        assert!(ent.cancel_at.is_some());
    }

    fn apple_event(
        org: Uuid,
        event_type: CanonicalEventType,
        status: EventStatus,
        key: &str,
    ) -> CanonicalEvent {
        let mut e = event(org, event_type, status, key);
        e.source = Source::Apple;
        e.idempotency_key = format!("apple:{}", key);
        e
    }

    async fn apple_state(store: &MemoryStore, org: Uuid, user: Uuid) -> EntitlementState {
        store
            .get_entitlement(org, user, None, Source::Apple)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn test_store_refund_is_sticky_until_purchase() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(
                org,
                user,
                &apple_event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"),
            )
            .await
            .unwrap();
        engine
            .apply(
                org,
                user,
                &apple_event(org, CanonicalEventType::Refund, EventStatus::Refunded, "r"),
            )
            .await
            .unwrap();
        assert_eq!(apple_state(&store, org, user).await, EntitlementState::Refunded);

        // A renewal cannot pull it out of refunded
        let outcome = engine
            .apply(
                org,
                user,
                &apple_event(org, CanonicalEventType::Renewal, EventStatus::Success, "r2"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::NoOp);
        assert_eq!(apple_state(&store, org, user).await, EntitlementState::Refunded);

        // A fresh purchase can
        let mut repurchase =
            apple_event(org, CanonicalEventType::Purchase, EventStatus::Success, "p2");
        repurchase.expiration_time = Some(Utc::now() + Duration::days(90));
        engine.apply(org, user, &repurchase).await.unwrap();
        assert_eq!(apple_state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_card_rail_refund_leaves_subscription_state() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        // A Stripe charge refund moves money, not subscription state
        let outcome = engine
            .apply(org, user, &event(org, CanonicalEventType::Refund, EventStatus::Refunded, "r"))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::NoOp);
        assert_eq!(state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_stale_period_rollback_rejected() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut purchase = event(org, CanonicalEventType::Purchase, EventStatus::Success, "p");
        purchase.expiration_time = Some(Utc::now() + Duration::days(60));
        engine.apply(org, user, &purchase).await.unwrap();

        let mut stale = event(org, CanonicalEventType::Renewal, EventStatus::Success, "old");
        stale.expiration_time = Some(Utc::now() + Duration::days(10));
        let outcome = engine.apply(org, user, &stale).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::RejectedStalePeriod);

        let ent = store
            .get_entitlement(org, user, None, Source::Stripe)
            .await
            .unwrap()
            .unwrap();
        assert!(ent.current_period_end.unwrap() > Utc::now() + Duration::days(50));
    }

    #[tokio::test]
    async fn test_history_appends_on_transition_not_noop() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        // A same-state renewal updates fields but adds no history
        let mut renewal = event(org, CanonicalEventType::Renewal, EventStatus::Success, "r");
        renewal.expiration_time = Some(Utc::now() + Duration::days(60));
        engine.apply(org, user, &renewal).await.unwrap();

        let ent = store
            .get_entitlement(org, user, None, Source::Stripe)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ent.state_history.len(), 1);
        assert_eq!(ent.state_history[0].from, EntitlementState::Inactive);
        assert_eq!(ent.state_history[0].to, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        engine
            .apply(org, user, &event(org, CanonicalEventType::Purchase, EventStatus::Success, "p"))
            .await
            .unwrap();
        engine
            .apply(org, user, &event(org, CanonicalEventType::Pause, EventStatus::Success, "z"))
            .await
            .unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::Paused);

        let mut resume = event(org, CanonicalEventType::Resume, EventStatus::Success, "u");
        resume.expiration_time = Some(Utc::now() + Duration::days(90));
        engine.apply(org, user, &resume).await.unwrap();
        assert_eq!(state(&store, org, user).await, EntitlementState::Active);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_for_terminal_state() {
        let (store, engine) = engine();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let purchase = apple_event(org, CanonicalEventType::Purchase, EventStatus::Success, "p");
        let refund = apple_event(org, CanonicalEventType::Refund, EventStatus::Refunded, "r");

        engine.apply(org, user, &purchase).await.unwrap();
        engine.apply(org, user, &refund).await.unwrap();
        // Replaying the same pair changes nothing
        engine.apply(org, user, &refund).await.unwrap();

        let ent = store
            .get_entitlement(org, user, None, Source::Apple)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ent.state, EntitlementState::Refunded);
        assert_eq!(ent.state_history.len(), 2);
    }
}
