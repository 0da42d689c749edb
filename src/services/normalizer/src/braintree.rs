//! Braintree webhook normalizer
//!
//! The connection's webhook secret authenticates an HMAC-SHA256 of the
//! raw body, delivered in the `bt-signature` header as hex. Notifications
//! are JSON `{kind, timestamp, subscription: {...}}`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, Environment, EventStatus, IdentityHint, IdentityType,
    Source,
};

use crate::error::{NormalizerError, Result};
use crate::RawHeaders;

pub const SIGNATURE_HEADER: &str = "bt-signature";

type HmacSha256 = Hmac<Sha256>;

pub fn verify_signature(raw: &[u8], headers: &RawHeaders, secret: &str) -> bool {
    let Some(header) = headers.get(SIGNATURE_HEADER) else {
        return false;
    };
    let Ok(expected) = hex::decode(header.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(raw);
    mac.verify_slice(&expected).is_ok()
}

pub fn normalize(org_id: Uuid, raw: &[u8], received_at: DateTime<Utc>) -> Result<Vec<CanonicalEvent>> {
    let payload: Value = serde_json::from_slice(raw)?;
    let kind = payload
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizerError::decode_failed("missing kind"))?
        .to_string();

    let mapped = match kind.as_str() {
        "subscription_charged_successfully" => {
            Some((CanonicalEventType::Renewal, EventStatus::Success))
        }
        "subscription_charged_unsuccessfully" | "subscription_went_past_due" => {
            Some((CanonicalEventType::BillingRetry, EventStatus::Failed))
        }
        "subscription_canceled" => Some((CanonicalEventType::Cancellation, EventStatus::Success)),
        "subscription_expired" => Some((CanonicalEventType::Expiration, EventStatus::Success)),
        "subscription_trial_ended" => {
            Some((CanonicalEventType::TrialConversion, EventStatus::Success))
        }
        other => {
            debug!(kind = other, "unmapped braintree notification, skipping");
            None
        }
    };
    let Some((event_type, status)) = mapped else {
        return Ok(Vec::new());
    };

    let subscription = payload.get("subscription").cloned().unwrap_or(Value::Null);
    let subscription_id = subscription
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizerError::decode_failed("missing subscription.id"))?
        .to_string();

    let event_time = payload
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(received_at);

    // Price arrives as a decimal currency string
    let amount_cents = subscription
        .get("price")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<f64>().ok())
        .map(|units| (units * 100.0).round() as i64);

    let event = CanonicalEvent {
        id: Uuid::new_v4(),
        org_id,
        source: Source::Braintree,
        source_event_type: kind.clone(),
        event_type,
        event_time,
        status,
        user_id: None,
        product_id: None,
        external_subscription_id: Some(subscription_id.clone()),
        external_event_id: None,
        idempotency_key: format!(
            "braintree:{}_{}_{}",
            subscription_id,
            kind,
            event_time.timestamp()
        ),
        amount_cents,
        currency: subscription
            .get("currency_iso_code")
            .and_then(Value::as_str)
            .map(|c| c.to_lowercase()),
        period_type: None,
        expiration_time: subscription
            .get("billing_period_end_date")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        cancellation_reason: None,
        environment: Environment::Production,
        raw_payload: revwatch_shared::sanitize::sanitize_payload(&payload),
        ingested_at: received_at,
    };

    Ok(vec![event])
}

pub fn extract_identity_hints(raw: &[u8]) -> Vec<IdentityHint> {
    let Ok(payload) = serde_json::from_slice::<Value>(raw) else {
        return Vec::new();
    };
    let subscription = payload.get("subscription").cloned().unwrap_or(Value::Null);
    let mut hints = Vec::new();

    if let Some(id) = subscription.get("id").and_then(Value::as_str) {
        hints.push(IdentityHint::new(
            Source::Braintree,
            IdentityType::SubscriptionId,
            id,
        ));
    }

    let customer_id = subscription
        .get("transactions")
        .and_then(|t| t.get(0))
        .and_then(|txn| txn.get("customer"))
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str);
    if let Some(id) = customer_id {
        hints.push(IdentityHint::new(
            Source::Braintree,
            IdentityType::CustomerId,
            id,
        ));
    }

    let email = subscription
        .get("transactions")
        .and_then(|t| t.get(0))
        .and_then(|txn| txn.get("customer"))
        .and_then(|c| c.get("email"))
        .and_then(Value::as_str);
    if let Some(email) = email {
        hints.push(IdentityHint::new(
            Source::Braintree,
            IdentityType::Email,
            email,
        ));
    }

    hints
}
