//! Timestamped HMAC webhook signatures
//!
//! The `t={unix},v1={hex_hmac_sha256(secret, "{t}.{body}")}` scheme is used
//! for inbound Stripe-style verification and for signing our own outbound
//! alert webhooks. A `whsec_` prefix on the secret is stripped before the
//! HMAC. Comparison is constant time; timestamps outside the tolerance
//! window reject to block replays.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, SecurityError};

type HmacSha256 = Hmac<Sha256>;

/// Replay window for timestamped signatures
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const SECRET_PREFIX: &str = "whsec_";

fn effective_secret(secret: &str) -> &str {
    secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret)
}

/// Compute the hex HMAC of `"{timestamp}.{body}"`
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(effective_secret(secret).as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Build the full `t=...,v1=...` header value
pub fn build_signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    format!("t={},v1={}", timestamp, sign_payload(secret, timestamp, body))
}

/// Verify a `t=...,v1=...` header against the raw body. Multiple `v1`
/// entries are accepted (secret rotation); any one matching passes. Fails
/// closed on malformed headers and on timestamps outside the tolerance.
pub fn verify_signature_header(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
    tolerance_secs: i64,
) -> bool {
    match parse_and_verify(secret, header, body, now_unix, tolerance_secs) {
        Ok(valid) => valid,
        Err(_) => false,
    }
}

fn parse_and_verify(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
    tolerance_secs: i64,
) -> Result<bool> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        let key = kv
            .next()
            .ok_or_else(|| SecurityError::malformed_signature("empty segment"))?;
        let value = kv
            .next()
            .ok_or_else(|| SecurityError::malformed_signature("segment missing value"))?;
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SecurityError::malformed_signature("timestamp is not an integer")
                })?);
            }
            "v1" => {
                let sig = hex::decode(value)
                    .map_err(|_| SecurityError::malformed_signature("signature is not hex"))?;
                candidates.push(sig);
            }
            // Unknown schemes (v0 etc.) are ignored, matching provider behavior
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| SecurityError::malformed_signature("missing timestamp"))?;
    if candidates.is_empty() {
        return Err(SecurityError::malformed_signature("missing v1 signature"));
    }

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Ok(false);
    }

    let valid = candidates.iter().any(|candidate| {
        let mut mac = HmacSha256::new_from_slice(effective_secret(secret).as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(candidate).is_ok()
    });

    Ok(valid)
}
