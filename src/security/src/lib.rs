//! Security primitives for the RevWatch platform
//!
//! - [`vault`] — authenticated encryption of provider credentials with
//!   previous-key rotation fallback
//! - [`api_keys`] — `rev_`-prefixed key generation and hash lookup material
//! - [`signing`] — the `t={ts},v1={hmac}` signature scheme shared by the
//!   Stripe-style inbound verifiers and our own outbound webhooks

pub mod api_keys;
pub mod error;
pub mod signing;
pub mod vault;

pub use api_keys::{generate_api_key, hash_api_key, GeneratedKey, API_KEY_PREFIX};
pub use error::{Result, SecurityError};
pub use signing::{build_signature_header, verify_signature_header, SIGNATURE_TOLERANCE_SECS};
pub use vault::CredentialVault;
