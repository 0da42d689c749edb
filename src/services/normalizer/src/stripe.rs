//! Stripe webhook normalizer
//!
//! Signature: `Stripe-Signature: t={ts},v1={hmac}` over `{ts}.{body}` with
//! the connection's `whsec_` secret, 300 s replay tolerance.
//!
//! One `customer.subscription.updated` payload can fan out into several
//! canonical events (cancellation, billing retry, trial conversion, plan
//! change); each gets a suffixed idempotency key so replays stay stable.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use revwatch_security::{verify_signature_header, SIGNATURE_TOLERANCE_SECS};
use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, Environment, EventStatus, IdentityHint, IdentityType,
    PeriodType, Source,
};

use crate::error::Result;
use crate::{epoch_secs_to_datetime, RawHeaders};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
    #[serde(default = "default_livemode")]
    livemode: bool,
}

fn default_livemode() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
    #[serde(default)]
    previous_attributes: Option<Value>,
}

/// Fails closed: absent header, malformed header, stale timestamp, or a
/// non-matching digest all return false.
pub fn verify_signature(raw: &[u8], headers: &RawHeaders, secret: &str, now: DateTime<Utc>) -> bool {
    match headers.get(SIGNATURE_HEADER) {
        Some(header) => verify_signature_header(
            secret,
            header,
            raw,
            now.timestamp(),
            SIGNATURE_TOLERANCE_SECS,
        ),
        None => false,
    }
}

pub fn normalize(org_id: Uuid, raw: &[u8], received_at: DateTime<Utc>) -> Result<Vec<CanonicalEvent>> {
    let event: StripeEvent = serde_json::from_slice(raw)?;
    let object = &event.data.object;
    let event_time = epoch_secs_to_datetime(event.created);
    let environment = if event.livemode {
        Environment::Production
    } else {
        Environment::Sandbox
    };

    let ctx = EventContext {
        org_id,
        source_event_type: event.event_type.clone(),
        event_time,
        environment,
        received_at,
        event_id: event.id.clone(),
        object: object.clone(),
    };

    let events = match event.event_type.as_str() {
        "customer.subscription.created" => {
            let trialing = object.get("status").and_then(Value::as_str) == Some("trialing");
            vec![ctx.build(
                CanonicalEventType::Purchase,
                EventStatus::Success,
                None,
                subscription_amount(object),
            )
            .with_period_type(if trialing {
                Some(PeriodType::Trial)
            } else {
                Some(PeriodType::Normal)
            })]
        }
        "customer.subscription.updated" => normalize_subscription_updated(&ctx, &event),
        "customer.subscription.deleted" => vec![ctx.build(
            CanonicalEventType::Expiration,
            EventStatus::Success,
            None,
            subscription_amount(object),
        )],
        "customer.subscription.paused" => vec![ctx.build(
            CanonicalEventType::Pause,
            EventStatus::Success,
            None,
            None,
        )],
        "customer.subscription.resumed" => vec![ctx.build(
            CanonicalEventType::Resume,
            EventStatus::Success,
            None,
            None,
        )],
        "invoice.paid" | "invoice.payment_succeeded" => {
            let first_invoice = object.get("billing_reason").and_then(Value::as_str)
                == Some("subscription_create");
            let kind = if first_invoice {
                CanonicalEventType::Purchase
            } else {
                CanonicalEventType::Renewal
            };
            vec![ctx.build(kind, EventStatus::Success, None, invoice_amount(object))]
        }
        "invoice.payment_failed" => vec![ctx.build(
            CanonicalEventType::BillingRetry,
            EventStatus::Failed,
            None,
            invoice_amount(object),
        )],
        "charge.refunded" => vec![ctx.build(
            CanonicalEventType::Refund,
            EventStatus::Refunded,
            None,
            object
                .get("amount_refunded")
                .and_then(Value::as_i64)
                .or_else(|| charge_amount(object)),
        )],
        "charge.dispute.created" => vec![ctx.build(
            CanonicalEventType::Chargeback,
            EventStatus::Failed,
            None,
            charge_amount(object),
        )],
        other => {
            debug!(event_type = other, "unmapped stripe event, skipping");
            Vec::new()
        }
    };

    Ok(events)
}

/// A subscription update can carry several state changes at once
fn normalize_subscription_updated(ctx: &EventContext, event: &StripeEvent) -> Vec<CanonicalEvent> {
    let object = &event.data.object;
    let previous = event.data.previous_attributes.as_ref();
    let mut out = Vec::new();

    let cancel_scheduled = object
        .get("cancel_at_period_end")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || object.get("canceled_at").and_then(Value::as_i64).is_some();
    let previously_cancelled = previous
        .and_then(|p| p.get("cancel_at_period_end"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || previous
            .and_then(|p| p.get("canceled_at"))
            .map(|v| !v.is_null())
            .unwrap_or(false);
    if cancel_scheduled && !previously_cancelled {
        out.push(
            ctx.build(
                CanonicalEventType::Cancellation,
                EventStatus::Success,
                Some("cancel"),
                None,
            )
            .with_cancellation_reason(Some("customer_cancelled".to_string())),
        );
    }

    let status = object.get("status").and_then(Value::as_str);
    let prev_status = previous.and_then(|p| p.get("status")).and_then(Value::as_str);

    if status == Some("past_due") && prev_status != Some("past_due") {
        out.push(ctx.build(
            CanonicalEventType::BillingRetry,
            EventStatus::Failed,
            Some("retry"),
            subscription_amount(object),
        ));
    }

    if prev_status == Some("trialing") && status == Some("active") {
        out.push(ctx.build(
            CanonicalEventType::TrialConversion,
            EventStatus::Success,
            Some("trialconv"),
            subscription_amount(object),
        ));
    }

    if let (Some(prev_amount), Some(curr_amount)) = (
        previous.and_then(subscription_amount_value),
        subscription_amount(object),
    ) {
        if curr_amount > prev_amount {
            out.push(ctx.build(
                CanonicalEventType::Upgrade,
                EventStatus::Success,
                Some("plan"),
                Some(curr_amount),
            ));
        } else if curr_amount < prev_amount {
            out.push(ctx.build(
                CanonicalEventType::Downgrade,
                EventStatus::Success,
                Some("plan"),
                Some(curr_amount),
            ));
        }
    }

    out
}

pub fn extract_identity_hints(raw: &[u8]) -> Vec<IdentityHint> {
    let Ok(event) = serde_json::from_slice::<StripeEvent>(raw) else {
        return Vec::new();
    };
    let object = &event.data.object;
    let mut hints = Vec::new();

    let customer = match object.get("customer") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        _ => object
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| id.starts_with("cus_"))
            .map(|s| s.to_string()),
    };
    if let Some(id) = customer {
        hints.push(IdentityHint::new(
            Source::Stripe,
            IdentityType::CustomerId,
            id,
        ));
    }

    let email = object
        .get("customer_email")
        .and_then(Value::as_str)
        .or_else(|| {
            object
                .get("customer")
                .and_then(|c| c.get("email"))
                .and_then(Value::as_str)
        });
    if let Some(email) = email {
        hints.push(IdentityHint::new(Source::Stripe, IdentityType::Email, email));
    }

    if let Some(sub_id) = subscription_id(object) {
        hints.push(IdentityHint::new(
            Source::Stripe,
            IdentityType::SubscriptionId,
            sub_id,
        ));
    }

    hints
}

struct EventContext {
    org_id: Uuid,
    source_event_type: String,
    event_time: DateTime<Utc>,
    environment: Environment,
    received_at: DateTime<Utc>,
    event_id: String,
    object: Value,
}

impl EventContext {
    fn build(
        &self,
        event_type: CanonicalEventType,
        status: EventStatus,
        discriminator: Option<&str>,
        amount_cents: Option<i64>,
    ) -> CanonicalEvent {
        let idempotency_key = match discriminator {
            Some(suffix) => format!("stripe:{}:{}", self.event_id, suffix),
            None => format!("stripe:{}", self.event_id),
        };
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: self.org_id,
            source: Source::Stripe,
            source_event_type: self.source_event_type.clone(),
            event_type,
            event_time: self.event_time,
            status,
            user_id: None,
            product_id: None,
            external_subscription_id: subscription_id(&self.object),
            external_event_id: Some(self.event_id.clone()),
            idempotency_key,
            amount_cents,
            currency: self
                .object
                .get("currency")
                .and_then(Value::as_str)
                .map(|c| c.to_string()),
            period_type: None,
            expiration_time: self
                .object
                .get("current_period_end")
                .and_then(Value::as_i64)
                .map(epoch_secs_to_datetime),
            cancellation_reason: None,
            environment: self.environment,
            raw_payload: revwatch_shared::sanitize::sanitize_payload(&self.object),
            ingested_at: self.received_at,
        }
    }
}

trait EventExt {
    fn with_period_type(self, period_type: Option<PeriodType>) -> Self;
    fn with_cancellation_reason(self, reason: Option<String>) -> Self;
}

impl EventExt for CanonicalEvent {
    fn with_period_type(mut self, period_type: Option<PeriodType>) -> Self {
        self.period_type = period_type;
        self
    }

    fn with_cancellation_reason(mut self, reason: Option<String>) -> Self {
        self.cancellation_reason = reason;
        self
    }
}

fn subscription_id(object: &Value) -> Option<String> {
    match object.get("subscription") {
        Some(Value::String(id)) => Some(id.clone()),
        _ => object
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| id.starts_with("sub_"))
            .map(|s| s.to_string()),
    }
}

/// `amount_paid ?? amount ?? price.unit_amount`
fn invoice_amount(object: &Value) -> Option<i64> {
    object
        .get("amount_paid")
        .and_then(Value::as_i64)
        .or_else(|| object.get("amount").and_then(Value::as_i64))
        .or_else(|| subscription_amount(object))
}

fn charge_amount(object: &Value) -> Option<i64> {
    object.get("amount").and_then(Value::as_i64)
}

fn subscription_amount(object: &Value) -> Option<i64> {
    subscription_amount_value(object)
}

fn subscription_amount_value(object: &Value) -> Option<i64> {
    object
        .get("plan")
        .and_then(|p| p.get("amount"))
        .and_then(Value::as_i64)
        .or_else(|| {
            object
                .get("price")
                .and_then(|p| p.get("unit_amount"))
                .and_then(Value::as_i64)
        })
        .or_else(|| {
            object
                .get("items")
                .and_then(|i| i.get("data"))
                .and_then(|d| d.get(0))
                .and_then(|item| item.get("price"))
                .and_then(|p| p.get("unit_amount"))
                .and_then(Value::as_i64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use revwatch_security::build_signature_header;
    use serde_json::json;

    fn headers_with_sig(secret: &str, body: &[u8], ts: i64) -> RawHeaders {
        let mut headers = RawHeaders::new();
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            build_signature_header(secret, ts, body),
        );
        headers
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let body = br#"{"id":"evt_1"}"#;
        let now = Utc::now();
        let headers = headers_with_sig("whsec_test", body, now.timestamp());
        assert!(verify_signature(body, &headers, "whsec_test", now));
        assert!(!verify_signature(body, &headers, "whsec_other", now));
        assert!(!verify_signature(body, &RawHeaders::new(), "whsec_test", now));
    }

    #[test]
    fn test_replay_window() {
        let body = br#"{"id":"evt_1"}"#;
        let now = Utc::now();
        let headers = headers_with_sig("whsec_test", body, now.timestamp() - 301);
        assert!(!verify_signature(body, &headers, "whsec_test", now));
    }

    #[test]
    fn test_subscription_created_maps_to_purchase() {
        let body = json!({
            "id": "evt_1",
            "type": "customer.subscription.created",
            "created": 1700000000,
            "livemode": true,
            "data": {"object": {
                "id": "sub_123",
                "customer": "cus_abc",
                "status": "active",
                "currency": "usd",
                "plan": {"amount": 1999},
                "current_period_end": 1702592000
            }}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, CanonicalEventType::Purchase);
        assert_eq!(events[0].amount_cents, Some(1999));
        assert_eq!(events[0].idempotency_key, "stripe:evt_1");
        assert_eq!(events[0].external_subscription_id.as_deref(), Some("sub_123"));
    }

    #[test]
    fn test_subscription_updated_fans_out() {
        let body = json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "created": 1700000000,
            "livemode": true,
            "data": {
                "object": {
                    "id": "sub_123",
                    "customer": "cus_abc",
                    "status": "active",
                    "cancel_at_period_end": true,
                    "plan": {"amount": 2999}
                },
                "previous_attributes": {
                    "status": "trialing",
                    "cancel_at_period_end": false,
                    "plan": {"amount": 1999}
                }
            }
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        let types: Vec<CanonicalEventType> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&CanonicalEventType::Cancellation));
        assert!(types.contains(&CanonicalEventType::TrialConversion));
        assert!(types.contains(&CanonicalEventType::Upgrade));

        let keys: Vec<&str> = events.iter().map(|e| e.idempotency_key.as_str()).collect();
        assert!(keys.contains(&"stripe:evt_2:cancel"));
        assert!(keys.contains(&"stripe:evt_2:trialconv"));
        assert!(keys.contains(&"stripe:evt_2:plan"));
    }

    #[test]
    fn test_refund_uses_refunded_amount() {
        let body = json!({
            "id": "evt_3",
            "type": "charge.refunded",
            "created": 1700000000,
            "livemode": true,
            "data": {"object": {
                "id": "ch_1",
                "customer": "cus_abc",
                "amount": 1999,
                "amount_refunded": 1999,
                "currency": "usd"
            }}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, CanonicalEventType::Refund);
        assert_eq!(events[0].status, EventStatus::Refunded);
        assert_eq!(events[0].amount_cents, Some(1999));
    }

    #[test]
    fn test_unmapped_event_skips() {
        let body = json!({
            "id": "evt_4",
            "type": "payment_method.attached",
            "created": 1700000000,
            "livemode": true,
            "data": {"object": {}}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_identity_hints_include_all_identifiers() {
        let body = json!({
            "id": "evt_5",
            "type": "invoice.paid",
            "created": 1700000000,
            "livemode": true,
            "data": {"object": {
                "customer": "cus_abc",
                "customer_email": "jane@example.com",
                "subscription": "sub_123",
                "amount_paid": 1999
            }}
        });
        let hints = extract_identity_hints(body.to_string().as_bytes());
        assert_eq!(hints.len(), 3);
        assert!(hints.iter().any(|h| h.id_type == IdentityType::CustomerId
            && h.external_id == "cus_abc"));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::Email
            && h.external_id == "jane@example.com"));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::SubscriptionId
            && h.external_id == "sub_123"));
    }

    #[test]
    fn test_raw_payload_is_sanitized() {
        let body = json!({
            "id": "evt_6",
            "type": "invoice.paid",
            "created": 1700000000,
            "livemode": true,
            "data": {"object": {
                "customer_email": "jane@example.com",
                "amount_paid": 1999
            }}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events[0].raw_payload["customer_email"], json!("[REDACTED]"));
    }
}
