//! Google Play Real-Time Developer Notifications normalizer
//!
//! Deliveries arrive as Pub/Sub push envelopes; `message.data` is the
//! base64 JSON developer notification. Authenticity rests on Pub/Sub push
//! auth (a JWT bearer token on the request); API-side credentials use the
//! OAuth2 service-account exchange in the backfill client, not here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, Environment, EventStatus, IdentityHint, IdentityType,
    Source,
};

use crate::error::{NormalizerError, Result};
use crate::{epoch_millis_to_datetime, RawHeaders};

// Google RTDN subscription notification types
const SUBSCRIPTION_RECOVERED: i64 = 1;
const SUBSCRIPTION_RENEWED: i64 = 2;
const SUBSCRIPTION_CANCELED: i64 = 3;
const SUBSCRIPTION_PURCHASED: i64 = 4;
const SUBSCRIPTION_ON_HOLD: i64 = 5;
const SUBSCRIPTION_IN_GRACE_PERIOD: i64 = 6;
const SUBSCRIPTION_RESTARTED: i64 = 7;
const SUBSCRIPTION_PRICE_CHANGE_CONFIRMED: i64 = 8;
const SUBSCRIPTION_PAUSED: i64 = 10;
const SUBSCRIPTION_REVOKED: i64 = 12;
const SUBSCRIPTION_EXPIRED: i64 = 13;

#[derive(Debug, Deserialize)]
struct PubSubEnvelope {
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: String,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

/// Pub/Sub push auth: the request must carry a structurally valid JWT
/// bearer token. Full claim verification is delegated to the push
/// endpoint's Pub/Sub subscription configuration.
pub fn verify_signature(headers: &RawHeaders) -> bool {
    let Some(auth) = headers.get("authorization") else {
        return false;
    };
    let Some(token) = auth.strip_prefix("Bearer ") else {
        return false;
    };
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.is_empty())
}

fn decode_envelope(raw: &[u8]) -> Result<(Value, Option<String>)> {
    let envelope: PubSubEnvelope = serde_json::from_slice(raw)?;
    let inner = BASE64
        .decode(envelope.message.data.as_bytes())
        .map_err(|e| NormalizerError::decode_failed(format!("message.data base64: {}", e)))?;
    let notification: Value = serde_json::from_slice(&inner)?;
    Ok((notification, envelope.message.message_id))
}

pub fn normalize(org_id: Uuid, raw: &[u8], received_at: DateTime<Utc>) -> Result<Vec<CanonicalEvent>> {
    let (notification, message_id) = decode_envelope(raw)?;

    if notification.get("testNotification").is_some() {
        debug!("google test notification, skipping");
        return Ok(Vec::new());
    }

    let event_time = notification
        .get("eventTimeMillis")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(epoch_millis_to_datetime)
        .unwrap_or(received_at);

    if let Some(voided) = notification.get("voidedPurchaseNotification") {
        return Ok(vec![build_event(
            org_id,
            "voidedPurchaseNotification".to_string(),
            CanonicalEventType::Refund,
            EventStatus::Refunded,
            event_time,
            received_at,
            voided
                .get("purchaseToken")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            idempotency_key(&message_id, &notification, "voided"),
            &notification,
        )]);
    }

    let Some(sub) = notification.get("subscriptionNotification") else {
        debug!("google notification without subscription payload, skipping");
        return Ok(Vec::new());
    };
    let notification_type = sub
        .get("notificationType")
        .and_then(Value::as_i64)
        .ok_or_else(|| NormalizerError::decode_failed("missing notificationType"))?;

    let mapped = match notification_type {
        SUBSCRIPTION_PURCHASED => Some((CanonicalEventType::Purchase, EventStatus::Success)),
        SUBSCRIPTION_RENEWED | SUBSCRIPTION_RECOVERED => {
            Some((CanonicalEventType::Renewal, EventStatus::Success))
        }
        SUBSCRIPTION_CANCELED => Some((CanonicalEventType::Cancellation, EventStatus::Success)),
        SUBSCRIPTION_ON_HOLD => Some((CanonicalEventType::BillingRetry, EventStatus::Failed)),
        SUBSCRIPTION_IN_GRACE_PERIOD => {
            Some((CanonicalEventType::GracePeriodStart, EventStatus::Failed))
        }
        SUBSCRIPTION_RESTARTED => Some((CanonicalEventType::Resume, EventStatus::Success)),
        SUBSCRIPTION_PRICE_CHANGE_CONFIRMED => {
            Some((CanonicalEventType::PriceChange, EventStatus::Success))
        }
        SUBSCRIPTION_PAUSED => Some((CanonicalEventType::Pause, EventStatus::Success)),
        SUBSCRIPTION_REVOKED => Some((CanonicalEventType::Revoke, EventStatus::Success)),
        SUBSCRIPTION_EXPIRED => Some((CanonicalEventType::Expiration, EventStatus::Success)),
        other => {
            debug!(notification_type = other, "unmapped google notification, skipping");
            None
        }
    };
    let Some((event_type, status)) = mapped else {
        return Ok(Vec::new());
    };

    let subscription_id = sub
        .get("subscriptionId")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    Ok(vec![build_event(
        org_id,
        format!("subscriptionNotification:{}", notification_type),
        event_type,
        status,
        event_time,
        received_at,
        subscription_id,
        idempotency_key(&message_id, &notification, &notification_type.to_string()),
        &notification,
    )])
}

#[allow(clippy::too_many_arguments)]
fn build_event(
    org_id: Uuid,
    source_event_type: String,
    event_type: CanonicalEventType,
    status: EventStatus,
    event_time: DateTime<Utc>,
    received_at: DateTime<Utc>,
    external_subscription_id: Option<String>,
    idempotency_key: String,
    notification: &Value,
) -> CanonicalEvent {
    CanonicalEvent {
        id: Uuid::new_v4(),
        org_id,
        source: Source::Google,
        source_event_type,
        event_type,
        event_time,
        status,
        user_id: None,
        product_id: None,
        external_subscription_id,
        external_event_id: None,
        idempotency_key,
        amount_cents: None,
        currency: None,
        period_type: None,
        expiration_time: None,
        cancellation_reason: None,
        environment: Environment::Production,
        raw_payload: revwatch_shared::sanitize::sanitize_payload(notification),
        ingested_at: received_at,
    }
}

/// Prefer the Pub/Sub message id; fall back to a composite of the
/// notification's own fields so replays of the same delivery still dedupe
fn idempotency_key(message_id: &Option<String>, notification: &Value, discriminator: &str) -> String {
    match message_id {
        Some(id) => format!("google:{}:{}", id, discriminator),
        None => {
            let time = notification
                .get("eventTimeMillis")
                .map(|v| v.to_string())
                .unwrap_or_default();
            let token = notification
                .get("subscriptionNotification")
                .or_else(|| notification.get("voidedPurchaseNotification"))
                .and_then(|s| s.get("purchaseToken"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("google:{}:{}:{}", time, token, discriminator)
        }
    }
}

pub fn extract_identity_hints(raw: &[u8]) -> Vec<IdentityHint> {
    let Ok((notification, _)) = decode_envelope(raw) else {
        return Vec::new();
    };
    let mut hints = Vec::new();

    let sub = notification
        .get("subscriptionNotification")
        .or_else(|| notification.get("voidedPurchaseNotification"));

    if let Some(token) = sub
        .and_then(|s| s.get("purchaseToken"))
        .and_then(Value::as_str)
    {
        hints.push(IdentityHint::new(
            Source::Google,
            IdentityType::PurchaseToken,
            token,
        ));
    }

    if let Some(subscription_id) = sub
        .and_then(|s| s.get("subscriptionId"))
        .and_then(Value::as_str)
    {
        hints.push(IdentityHint::new(
            Source::Google,
            IdentityType::SubscriptionId,
            subscription_id,
        ));
    }

    if let Some(package) = notification.get("packageName").and_then(Value::as_str) {
        hints.push(IdentityHint::new(
            Source::Google,
            IdentityType::BundleId,
            package,
        ));
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope(notification: &Value) -> Vec<u8> {
        json!({
            "message": {
                "data": BASE64.encode(notification.to_string().as_bytes()),
                "messageId": "pubsub-msg-1"
            },
            "subscription": "projects/example/subscriptions/rtdn"
        })
        .to_string()
        .into_bytes()
    }

    fn subscription_notification(notification_type: i64) -> Value {
        json!({
            "version": "1.0",
            "packageName": "com.example.app",
            "eventTimeMillis": "1700000000000",
            "subscriptionNotification": {
                "version": "1.0",
                "notificationType": notification_type,
                "purchaseToken": "token-abc",
                "subscriptionId": "monthly_pro"
            }
        })
    }

    #[test]
    fn test_purchase_mapping() {
        let raw = envelope(&subscription_notification(SUBSCRIPTION_PURCHASED));
        let events = normalize(Uuid::new_v4(), &raw, Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, CanonicalEventType::Purchase);
        assert_eq!(events[0].idempotency_key, "google:pubsub-msg-1:4");
        assert_eq!(
            events[0].external_subscription_id.as_deref(),
            Some("monthly_pro")
        );
    }

    #[test]
    fn test_expired_mapping() {
        let raw = envelope(&subscription_notification(SUBSCRIPTION_EXPIRED));
        let events = normalize(Uuid::new_v4(), &raw, Utc::now()).unwrap();
        assert_eq!(events[0].event_type, CanonicalEventType::Expiration);
    }

    #[test]
    fn test_voided_purchase_maps_to_refund() {
        let notification = json!({
            "packageName": "com.example.app",
            "eventTimeMillis": "1700000000000",
            "voidedPurchaseNotification": {
                "purchaseToken": "token-abc",
                "orderId": "GPA.1234",
                "productType": 1
            }
        });
        let raw = envelope(&notification);
        let events = normalize(Uuid::new_v4(), &raw, Utc::now()).unwrap();
        assert_eq!(events[0].event_type, CanonicalEventType::Refund);
        assert_eq!(events[0].status, EventStatus::Refunded);
    }

    #[test]
    fn test_test_notification_skips() {
        let notification = json!({
            "packageName": "com.example.app",
            "eventTimeMillis": "1700000000000",
            "testNotification": {"version": "1.0"}
        });
        let events = normalize(Uuid::new_v4(), &envelope(&notification), Utc::now()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_verify_requires_bearer_jwt() {
        let mut headers = RawHeaders::new();
        assert!(!verify_signature(&headers));

        headers.insert("authorization".into(), "Bearer not-a-jwt".into());
        assert!(!verify_signature(&headers));

        headers.insert("authorization".into(), "Bearer aGVhZA.cGF5bG9hZA.c2ln".into());
        assert!(verify_signature(&headers));
    }

    #[test]
    fn test_identity_hints() {
        let raw = envelope(&subscription_notification(SUBSCRIPTION_RENEWED));
        let hints = extract_identity_hints(&raw);
        assert!(hints.iter().any(|h| h.id_type == IdentityType::PurchaseToken
            && h.external_id == "token-abc"));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::SubscriptionId));
        assert!(hints.iter().any(|h| h.id_type == IdentityType::BundleId
            && h.external_id == "com.example.app"));
    }
}
