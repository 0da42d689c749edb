//! Recurly webhook normalizer
//!
//! Signature header: `recurly-signature: {timestamp},{sig1},{sig2},…` —
//! HMAC-SHA256 of `{timestamp}.{body}`, 300 s tolerance, any listed
//! signature may match (secret rotation). Comparison is constant time.

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
use crate::{epoch_secs_to_datetime, RawHeaders};

pub const SIGNATURE_HEADER: &str = "recurly-signature";
const TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// `{timestamp},{sig1},{sig2},…` with millisecond timestamps
pub fn verify_signature(raw: &[u8], headers: &RawHeaders, secret: &str, now: DateTime<Utc>) -> bool {
    let Some(header) = headers.get(SIGNATURE_HEADER) else {
        return false;
    };

    let mut parts = header.split(',');
    let Some(timestamp_raw) = parts.next() else {
        return false;
    };
    let Ok(timestamp_ms) = timestamp_raw.trim().parse::<i64>() else {
        return false;
    };

    if (now.timestamp() - timestamp_ms / 1000).abs() > TOLERANCE_SECS {
        return false;
    }

    let mut any_match = false;
    for candidate in parts {
        let Ok(sig) = hex::decode(candidate.trim()) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp_raw.trim().as_bytes());
        mac.update(b".");
        mac.update(raw);
        if mac.verify_slice(&sig).is_ok() {
            any_match = true;
        }
    }
    any_match
}

pub fn normalize(org_id: Uuid, raw: &[u8], received_at: DateTime<Utc>) -> Result<Vec<CanonicalEvent>> {
    let payload: Value = serde_json::from_slice(raw)?;
    let event_type_raw = payload
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizerError::decode_failed("missing event_type"))?
        .to_string();

    let mapped = match event_type_raw.as_str() {
        "new_subscription_notification" => {
            Some((CanonicalEventType::Purchase, EventStatus::Success))
        }
        "renewed_subscription_notification" | "successful_payment_notification" => {
            Some((CanonicalEventType::Renewal, EventStatus::Success))
        }
        "failed_payment_notification" => {
            Some((CanonicalEventType::BillingRetry, EventStatus::Failed))
        }
        "canceled_subscription_notification" => {
            Some((CanonicalEventType::Cancellation, EventStatus::Success))
        }
        "expired_subscription_notification" => {
            Some((CanonicalEventType::Expiration, EventStatus::Success))
        }
        "successful_refund_notification" => {
            Some((CanonicalEventType::Refund, EventStatus::Refunded))
        }
        "new_dispute_notification" => {
            Some((CanonicalEventType::Chargeback, EventStatus::Failed))
        }
        "paused_subscription_notification" => {
            Some((CanonicalEventType::Pause, EventStatus::Success))
        }
        "resumed_subscription_notification" | "reactivated_account_notification" => {
            Some((CanonicalEventType::Resume, EventStatus::Success))
        }
        "updated_subscription_notification" => None,
        // Explicitly non-emitting
        "new_charge_invoice_notification" => None,
        other => {
            debug!(event_type = other, "unmapped recurly notification, skipping");
            None
        }
    };
    let Some((event_type, status)) = mapped else {
        return Ok(Vec::new());
    };

    let subscription = payload.get("subscription").cloned().unwrap_or(Value::Null);
    let transaction = payload.get("transaction").cloned().unwrap_or(Value::Null);
    let invoice = payload.get("invoice").cloned().unwrap_or(Value::Null);

    let subscription_uuid = subscription
        .get("uuid")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    // Transaction amount over invoice total over unit amount
    let amount_cents = transaction
        .get("amount_in_cents")
        .and_then(Value::as_i64)
        .or_else(|| invoice.get("total_in_cents").and_then(Value::as_i64))
        .or_else(|| {
            subscription
                .get("unit_amount_in_cents")
                .and_then(Value::as_i64)
        });

    let provider_event_id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .or_else(|| {
            transaction
                .get("uuid")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .or_else(|| subscription_uuid.as_ref().map(|u| format!("{}_{}", u, event_type_raw)))
        .ok_or_else(|| NormalizerError::decode_failed("no identifier for idempotency key"))?;

    let event_time = payload
        .get("timestamp")
        .and_then(Value::as_i64)
        .map(epoch_secs_to_datetime)
        .unwrap_or(received_at);

    let event = CanonicalEvent {
        id: Uuid::new_v4(),
        org_id,
        source: Source::Recurly,
        source_event_type: event_type_raw,
        event_type,
        event_time,
        status,
        user_id: None,
        product_id: None,
        external_subscription_id: subscription_uuid,
        external_event_id: Some(provider_event_id.clone()),
        idempotency_key: format!("recurly:{}", provider_event_id),
        amount_cents,
        currency: transaction
            .get("currency")
            .or_else(|| invoice.get("currency"))
            .and_then(Value::as_str)
            .map(|c| c.to_lowercase()),
        period_type: None,
        expiration_time: subscription
            .get("current_period_ends_at")
            .and_then(Value::as_i64)
            .map(epoch_secs_to_datetime),
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
    let account = payload.get("account").cloned().unwrap_or(Value::Null);
    let mut hints = Vec::new();

    if let Some(code) = account.get("account_code").and_then(Value::as_str) {
        hints.push(IdentityHint::new(
            Source::Recurly,
            IdentityType::AccountCode,
            code,
        ));
    }
    if let Some(email) = account.get("email").and_then(Value::as_str) {
        hints.push(IdentityHint::new(Source::Recurly, IdentityType::Email, email));
    }
    if let Some(uuid) = payload
        .get("subscription")
        .and_then(|s| s.get("uuid"))
        .and_then(Value::as_str)
    {
        hints.push(IdentityHint::new(
            Source::Recurly,
            IdentityType::SubscriptionId,
            uuid,
        ));
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn signed_headers(secret: &str, body: &[u8], now: DateTime<Utc>) -> RawHeaders {
        let ts_ms = now.timestamp_millis();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts_ms.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let mut headers = RawHeaders::new();
        headers.insert(SIGNATURE_HEADER.to_string(), format!("{},{}", ts_ms, sig));
        headers
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"event_type":"renewed_subscription_notification"}"#;
        let now = Utc::now();
        let headers = signed_headers("recurly-secret", body, now);
        assert!(verify_signature(body, &headers, "recurly-secret", now));
        assert!(!verify_signature(body, &headers, "wrong-secret", now));
    }

    #[test]
    fn test_any_of_multiple_signatures_matches() {
        let body = br#"{"event_type":"x"}"#;
        let now = Utc::now();
        let base = signed_headers("recurly-secret", body, now);
        let original = base.get(SIGNATURE_HEADER).unwrap().clone();
        let (ts, sig) = original.split_once(',').unwrap();
        let mut headers = RawHeaders::new();
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            format!("{},{},{}", ts, "ab".repeat(32), sig),
        );
        assert!(verify_signature(body, &headers, "recurly-secret", now));
    }

    #[test]
    fn test_replay_window() {
        let body = br#"{"event_type":"x"}"#;
        let then = Utc::now() - chrono::Duration::seconds(301);
        let headers = signed_headers("recurly-secret", body, then);
        assert!(!verify_signature(body, &headers, "recurly-secret", Utc::now()));
    }

    #[test]
    fn test_amount_preference_order() {
        let body = json!({
            "id": "note-1",
            "event_type": "successful_payment_notification",
            "account": {"account_code": "acct-1"},
            "subscription": {"uuid": "sub-uuid", "unit_amount_in_cents": 999},
            "invoice": {"total_in_cents": 1099},
            "transaction": {"uuid": "txn-1", "amount_in_cents": 1199, "currency": "USD"}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events[0].amount_cents, Some(1199));

        let body_no_txn = json!({
            "id": "note-2",
            "event_type": "successful_payment_notification",
            "subscription": {"uuid": "sub-uuid", "unit_amount_in_cents": 999},
            "invoice": {"total_in_cents": 1099}
        });
        let events = normalize(Uuid::new_v4(), body_no_txn.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events[0].amount_cents, Some(1099));
    }

    #[test]
    fn test_new_charge_invoice_is_skipped() {
        let body = json!({
            "id": "note-3",
            "event_type": "new_charge_invoice_notification",
            "invoice": {"total_in_cents": 1099}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_idempotency_key_prefix() {
        let body = json!({
            "id": "note-4",
            "event_type": "new_subscription_notification",
            "subscription": {"uuid": "sub-uuid"}
        });
        let events = normalize(Uuid::new_v4(), body.to_string().as_bytes(), Utc::now()).unwrap();
        assert_eq!(events[0].idempotency_key, "recurly:note-4");
    }

    #[test]
    fn test_identity_hints() {
        let body = json!({
            "id": "note-5",
            "event_type": "new_subscription_notification",
            "account": {"account_code": "acct-1", "email": "jane@example.com"},
            "subscription": {"uuid": "sub-uuid"}
        });
        let hints = extract_identity_hints(body.to_string().as_bytes());
        assert_eq!(hints.len(), 3);
        assert!(hints.iter().any(|h| h.id_type == IdentityType::AccountCode));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::Email));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::SubscriptionId));
    }
}
