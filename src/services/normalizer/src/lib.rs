//! Webhook normalizers
//!
//! One module per billing source. Each exposes the same capability set:
//!
//! - `verify_signature(raw, headers, secret, now)` — fails closed on any
//!   malformed input
//! - `normalize(org_id, raw, received_at)` — maps one provider
//!   notification to zero or more [`CanonicalEvent`]s; unmapped provider
//!   event types produce an empty list (skipped)
//! - `extract_identity_hints(raw)` — every identifier present in the
//!   payload, for the identity resolver
//!
//! [`dispatch`] switches over [`Source`] at the pipeline seam. Idempotency
//! keys are `{source}:{provider_event_id}[:{discriminator}]` — the source
//! prefix prevents cross-provider collisions.

pub mod apple;
pub mod braintree;
pub mod error;
pub mod google;
pub mod recurly;
pub mod stripe;

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use revwatch_shared::{CanonicalEvent, IdentityHint, Source};

pub use error::{NormalizerError, Result};

/// Lowercased header map as captured by the webhook receiver
pub type RawHeaders = HashMap<String, String>;

pub mod dispatch {
    //! The enum switch the ingestion pipeline calls through

    use super::*;

    /// Verify a delivery's signature. Any exception inside a provider
    /// verifier is treated as failure.
    pub fn verify_signature(
        source: Source,
        raw: &[u8],
        headers: &RawHeaders,
        secret: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match source {
            Source::Stripe => stripe::verify_signature(raw, headers, secret, now),
            Source::Apple => apple::verify_signature(raw),
            Source::Google => google::verify_signature(headers),
            Source::Recurly => recurly::verify_signature(raw, headers, secret, now),
            Source::Braintree => braintree::verify_signature(raw, headers, secret),
        }
    }

    /// Decode and map a provider notification to canonical events
    pub fn normalize(
        source: Source,
        org_id: Uuid,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<CanonicalEvent>> {
        match source {
            Source::Stripe => stripe::normalize(org_id, raw, received_at),
            Source::Apple => apple::normalize(org_id, raw, received_at),
            Source::Google => google::normalize(org_id, raw, received_at),
            Source::Recurly => recurly::normalize(org_id, raw, received_at),
            Source::Braintree => braintree::normalize(org_id, raw, received_at),
        }
    }

    /// Pull every identifier out of a raw notification
    pub fn extract_identity_hints(source: Source, raw: &[u8]) -> Vec<IdentityHint> {
        match source {
            Source::Stripe => stripe::extract_identity_hints(raw),
            Source::Apple => apple::extract_identity_hints(raw),
            Source::Google => google::extract_identity_hints(raw),
            Source::Recurly => recurly::extract_identity_hints(raw),
            Source::Braintree => braintree::extract_identity_hints(raw),
        }
    }
}

pub(crate) fn epoch_secs_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn epoch_millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
