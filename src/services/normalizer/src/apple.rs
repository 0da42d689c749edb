//! Apple App Store Server Notifications v2 normalizer
//!
//! Deliveries are `{"signedPayload": "<JWS>"}`. Verification walks the
//! `x5c` chain: at least three certificates, the root bit-exact equal to
//! the embedded Apple Root CA G3, and the JWS signature checked against
//! the leaf certificate's P-256 key using the header-declared algorithm.
//!
//! The decoded payload nests a second JWS (`signedTransactionInfo`)
//! carrying the transaction. Prices arrive in milliunits of currency.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use revwatch_shared::{
    CanonicalEvent, CanonicalEventType, Environment, EventStatus, IdentityHint, IdentityType,
    PeriodType, Source,
};

use crate::error::{NormalizerError, Result};
use crate::epoch_millis_to_datetime;

/// Apple Root CA - G3 (DER, base64). The last certificate of every
/// notification's x5c chain must match these bytes exactly.
const APPLE_ROOT_CA_G3_B64: &str = "MIICQzCCAcmgAwIBAgIILcX8iNLFS5UwCgYIKoZIzj0EAwMwZzEbMBkGA1UEAwwS\
QXBwbGUgUm9vdCBDQSAtIEczMSYwJAYDVQQLDB1BcHBsZSBDZXJ0aWZpY2F0aW9u\
IEF1dGhvcml0eTETMBEGA1UECgwKQXBwbGUgSW5jLjELMAkGA1UEBhMCVVMwHhcN\
MTQwNDMwMTgxOTA2WhcNMzkwNDMwMTgxOTA2WjBnMRswGQYDVQQDDBJBcHBsZSBS\
b290IENBIC0gRzMxJjAkBgNVBAsMHUFwcGxlIENlcnRpZmljYXRpb24gQXV0aG9y\
aXR5MRMwEQYDVQQKDApBcHBsZSBJbmMuMQswCQYDVQQGEwJVUzB2MBAGByqGSM49\
AgEGBSuBBAAiA2IABJjpLz1AcqTtkyJygRMc3RCV8cWjTnHcFBbZDuWmBSp3ZHtf\
TjjTuxxEtX/1H7YyYl3J6YRbTzBPEVoA/VhYDKX1DyxNB0cTddqXl5dvMVztK517\
IDvYuVTZXpmkOlEKMaNCMEAwHQYDVR0OBBYEFLuw3qFYM4iapIqZ3r6966/ayySr\
MA8GA1UdEwEB/wQFMAMBAf8wDgYDVR0PAQH/BAQDAgEGMAoGCCqGSM49BAMDA2gA\
MGUCMQCD6cHEFl4aXTQY2e3v9GwOAEZLuN+yRhHFD/3meoyhpmvOwgPUnPWTxnS4\
at+qIxUCMG1mihDK1A3UT82NQz60imOlM27jbdoXt2QfyFMm+YhidDkLF1vLUagM\
6BgD56KyKA==";

const MIN_CHAIN_LEN: usize = 3;

#[derive(Debug, Deserialize)]
struct NotificationBody {
    #[serde(rename = "signedPayload")]
    signed_payload: String,
}

/// Verify the outer JWS. Fails closed on every malformed input.
pub fn verify_signature(raw: &[u8]) -> bool {
    match try_verify(raw) {
        Ok(valid) => valid,
        Err(err) => {
            warn!(error = %err, "apple signature verification failed closed");
            false
        }
    }
}

fn try_verify(raw: &[u8]) -> Result<bool> {
    let body: NotificationBody = serde_json::from_slice(raw)?;
    let token = &body.signed_payload;

    let header = decode_header(token)
        .map_err(|e| NormalizerError::signature_invalid(format!("JWS header: {}", e)))?;
    let chain = header
        .x5c
        .ok_or_else(|| NormalizerError::signature_invalid("missing x5c chain"))?;
    if chain.len() < MIN_CHAIN_LEN {
        return Err(NormalizerError::signature_invalid(format!(
            "x5c chain has {} certs, need at least {}",
            chain.len(),
            MIN_CHAIN_LEN
        )));
    }

    let root_der = BASE64
        .decode(chain.last().expect("non-empty chain").as_bytes())
        .map_err(|e| NormalizerError::signature_invalid(format!("root cert base64: {}", e)))?;
    let expected_root = BASE64
        .decode(APPLE_ROOT_CA_G3_B64)
        .expect("embedded root certificate is valid base64");
    if root_der != expected_root {
        return Err(NormalizerError::signature_invalid(
            "root certificate does not match Apple Root CA G3",
        ));
    }

    let leaf_der = BASE64
        .decode(chain[0].as_bytes())
        .map_err(|e| NormalizerError::signature_invalid(format!("leaf cert base64: {}", e)))?;
    let leaf_key = extract_p256_public_key(&leaf_der).ok_or_else(|| {
        NormalizerError::signature_invalid("leaf certificate carries no P-256 key")
    })?;

    let mut validation = Validation::new(match header.alg {
        Algorithm::ES256 => Algorithm::ES256,
        other => {
            return Err(NormalizerError::signature_invalid(format!(
                "unexpected JWS algorithm: {:?}",
                other
            )))
        }
    });
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<Value>(token, &DecodingKey::from_ec_der(&leaf_key), &validation) {
        Ok(_) => Ok(true),
        Err(e) => Err(NormalizerError::signature_invalid(format!(
            "JWS signature: {}",
            e
        ))),
    }
}

/// The P-256 SubjectPublicKeyInfo is the only 66-byte BIT STRING in the
/// certificate: 0x03 0x42 0x00 followed by the uncompressed point.
fn extract_p256_public_key(der: &[u8]) -> Option<Vec<u8>> {
    der.windows(4)
        .position(|w| w == [0x03, 0x42, 0x00, 0x04])
        .and_then(|pos| der.get(pos + 3..pos + 3 + 65))
        .map(|point| point.to_vec())
}

fn decode_jws_payload(token: &str) -> Result<Value> {
    let mut parts = token.split('.');
    let _header = parts
        .next()
        .ok_or_else(|| NormalizerError::decode_failed("empty JWS"))?;
    let payload = parts
        .next()
        .ok_or_else(|| NormalizerError::decode_failed("JWS missing payload"))?;
    let bytes = BASE64_URL
        .decode(payload)
        .map_err(|e| NormalizerError::decode_failed(format!("JWS payload base64: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn normalize(org_id: Uuid, raw: &[u8], received_at: DateTime<Utc>) -> Result<Vec<CanonicalEvent>> {
    let body: NotificationBody = serde_json::from_slice(raw)?;
    let payload = decode_jws_payload(&body.signed_payload)?;

    let notification_type = payload
        .get("notificationType")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizerError::decode_failed("missing notificationType"))?
        .to_string();
    let subtype = payload
        .get("subtype")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let notification_uuid = payload
        .get("notificationUUID")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizerError::decode_failed("missing notificationUUID"))?
        .to_string();

    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let transaction = data
        .get("signedTransactionInfo")
        .and_then(Value::as_str)
        .map(decode_jws_payload)
        .transpose()?
        .unwrap_or(Value::Null);

    let environment = match data.get("environment").and_then(Value::as_str) {
        Some("Sandbox") => Environment::Sandbox,
        _ => Environment::Production,
    };

    let source_event_type = match &subtype {
        Some(sub) => format!("{}:{}", notification_type, sub),
        None => notification_type.clone(),
    };

    let mapped = map_notification(&notification_type, subtype.as_deref());
    let Some((event_type, status)) = mapped else {
        debug!(
            notification_type = %notification_type,
            "unmapped apple notification, skipping"
        );
        return Ok(Vec::new());
    };

    let event_time = transaction
        .get("signedDate")
        .or_else(|| payload.get("signedDate"))
        .and_then(Value::as_i64)
        .map(epoch_millis_to_datetime)
        .unwrap_or(received_at);

    // Prices arrive in milliunits of the currency
    let amount_cents = transaction
        .get("price")
        .and_then(Value::as_i64)
        .map(|milliunits| milliunits / 10);

    let period_type = match transaction.get("offerType").and_then(Value::as_i64) {
        Some(1) => Some(PeriodType::Trial),
        Some(_) => Some(PeriodType::Intro),
        None => None,
    };

    let event = CanonicalEvent {
        id: Uuid::new_v4(),
        org_id,
        source: Source::Apple,
        source_event_type,
        event_type,
        event_time,
        status,
        user_id: None,
        product_id: None,
        external_subscription_id: transaction
            .get("originalTransactionId")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        external_event_id: Some(notification_uuid.clone()),
        idempotency_key: format!("apple:{}", notification_uuid),
        amount_cents,
        currency: transaction
            .get("currency")
            .and_then(Value::as_str)
            .map(|c| c.to_lowercase()),
        period_type,
        expiration_time: transaction
            .get("expiresDate")
            .and_then(Value::as_i64)
            .map(epoch_millis_to_datetime),
        cancellation_reason: subtype.clone(),
        environment,
        raw_payload: revwatch_shared::sanitize::sanitize_payload(&payload),
        ingested_at: received_at,
    };

    Ok(vec![event])
}

fn map_notification(
    notification_type: &str,
    subtype: Option<&str>,
) -> Option<(CanonicalEventType, EventStatus)> {
    match (notification_type, subtype) {
        ("SUBSCRIBED", _) => Some((CanonicalEventType::Purchase, EventStatus::Success)),
        ("DID_RENEW", _) => Some((CanonicalEventType::Renewal, EventStatus::Success)),
        ("DID_FAIL_TO_RENEW", Some("GRACE_PERIOD")) => {
            Some((CanonicalEventType::GracePeriodStart, EventStatus::Failed))
        }
        ("DID_FAIL_TO_RENEW", _) => Some((CanonicalEventType::BillingRetry, EventStatus::Failed)),
        ("GRACE_PERIOD_EXPIRED", _) => {
            Some((CanonicalEventType::GracePeriodEnd, EventStatus::Failed))
        }
        ("DID_CHANGE_RENEWAL_STATUS", Some("AUTO_RENEW_DISABLED")) => {
            Some((CanonicalEventType::Cancellation, EventStatus::Success))
        }
        ("DID_CHANGE_RENEWAL_STATUS", _) => None,
        ("DID_CHANGE_RENEWAL_PREF", Some("UPGRADE")) => {
            Some((CanonicalEventType::Upgrade, EventStatus::Success))
        }
        ("DID_CHANGE_RENEWAL_PREF", Some("DOWNGRADE")) => {
            Some((CanonicalEventType::Downgrade, EventStatus::Success))
        }
        ("DID_CHANGE_RENEWAL_PREF", _) => None,
        ("EXPIRED", Some("BILLING_RETRY")) => {
            Some((CanonicalEventType::Expiration, EventStatus::Failed))
        }
        ("EXPIRED", _) => Some((CanonicalEventType::Expiration, EventStatus::Success)),
        ("REFUND", _) => Some((CanonicalEventType::Refund, EventStatus::Refunded)),
        ("REVOKE", _) => Some((CanonicalEventType::Revoke, EventStatus::Success)),
        ("OFFER_REDEEMED", _) => Some((CanonicalEventType::OfferRedeemed, EventStatus::Success)),
        ("PRICE_INCREASE", _) => Some((CanonicalEventType::PriceChange, EventStatus::Success)),
        _ => None,
    }
}

pub fn extract_identity_hints(raw: &[u8]) -> Vec<IdentityHint> {
    let Ok(body) = serde_json::from_slice::<NotificationBody>(raw) else {
        return Vec::new();
    };
    let Ok(payload) = decode_jws_payload(&body.signed_payload) else {
        return Vec::new();
    };
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let transaction = data
        .get("signedTransactionInfo")
        .and_then(Value::as_str)
        .and_then(|token| decode_jws_payload(token).ok())
        .unwrap_or(Value::Null);

    let mut hints = Vec::new();

    if let Some(original_tx) = transaction
        .get("originalTransactionId")
        .and_then(Value::as_str)
    {
        hints.push(IdentityHint::new(
            Source::Apple,
            IdentityType::OriginalTransactionId,
            original_tx,
        ));
    }

    if let Some(token) = transaction.get("appAccountToken").and_then(Value::as_str) {
        hints.push(IdentityHint::new(
            Source::Apple,
            IdentityType::AppUserId,
            token,
        ));
    }

    let bundle_id = data
        .get("bundleId")
        .or_else(|| transaction.get("bundleId"))
        .and_then(Value::as_str);
    if let Some(bundle) = bundle_id {
        let mut hint = IdentityHint::new(Source::Apple, IdentityType::BundleId, bundle);
        if let Some(product) = transaction.get("productId").and_then(Value::as_str) {
            hint = hint.with_metadata(serde_json::json!({ "product_id": product }));
        }
        hints.push(hint);
    }

    hints
}
