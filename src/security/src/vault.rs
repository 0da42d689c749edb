//! Credential vault
//!
//! Symmetric authenticated encryption (AES-256-GCM) for provider secrets
//! at rest. The ciphertext envelope is `enc:v1:{nonce}:{tag}:{payload}`
//! with each segment base64-encoded. A secondary previous key permits
//! lossless rotation: decryption tries the current key first and falls
//! back to the previous key on auth failure; encryption always uses the
//! current key. Legacy plaintext values (no `enc:` prefix) pass through
//! untouched.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecurityError};

const ENVELOPE_PREFIX: &str = "enc:";
const ENVELOPE_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// 32-byte key wrapper, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SecurityError::invalid_key(format!("key is not valid hex: {}", e)))?;
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SecurityError::invalid_key("key must be exactly 32 bytes (64 hex)"))?;
        Ok(Self(arr))
    }
}

/// Encrypts and decrypts provider credentials
#[derive(Clone)]
pub struct CredentialVault {
    current: Option<VaultKey>,
    previous: Option<VaultKey>,
}

impl CredentialVault {
    /// Build a vault from 64-hex key strings. Either key may be absent;
    /// a vault with no current key can still pass plaintext through but
    /// fails on any `enc:` value.
    pub fn new(current_hex: Option<&str>, previous_hex: Option<&str>) -> Result<Self> {
        let current = current_hex.map(VaultKey::from_hex).transpose()?;
        let previous = previous_hex.map(VaultKey::from_hex).transpose()?;
        Ok(Self { current, previous })
    }

    /// A vault that never encrypts (dev mode without a configured key)
    pub fn disabled() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.current.is_some()
    }

    /// Encrypt a secret with the current key. Without a configured key the
    /// value is returned as-is so dev setups keep working.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let Some(key) = &self.current else {
            return Ok(plaintext.to_string());
        };

        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|_| SecurityError::invalid_key("AES key rejected"))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: ENVELOPE_VERSION.as_bytes(),
                },
            )
            .map_err(|_| SecurityError::CryptoAuth)?;

        // aes-gcm appends the tag; split it out for the envelope
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}{}:{}:{}:{}",
            ENVELOPE_PREFIX,
            ENVELOPE_VERSION,
            BASE64.encode(nonce_bytes),
            BASE64.encode(&tag),
            BASE64.encode(&sealed),
        ))
    }

    /// Decrypt a stored value. Plaintext (no `enc:` prefix) passes
    /// through. Fails with [`SecurityError::ConfigMissing`] when an
    /// encrypted value is presented without any configured key, and with
    /// [`SecurityError::CryptoAuth`] when no key authenticates it.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(rest) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_string());
        };

        if self.current.is_none() && self.previous.is_none() {
            return Err(SecurityError::ConfigMissing);
        }

        let (nonce, tag, payload) = parse_envelope(rest)?;

        let mut sealed = payload;
        sealed.extend_from_slice(&tag);

        if let Some(key) = &self.current {
            if let Ok(plain) = try_open(key, &nonce, &sealed) {
                return Ok(plain);
            }
        }
        if let Some(key) = &self.previous {
            if let Ok(plain) = try_open(key, &nonce, &sealed) {
                return Ok(plain);
            }
        }

        Err(SecurityError::CryptoAuth)
    }
}

fn try_open(key: &VaultKey, nonce: &[u8], sealed: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| SecurityError::invalid_key("AES key rejected"))?;
    let plain = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: ENVELOPE_VERSION.as_bytes(),
            },
        )
        .map_err(|_| SecurityError::CryptoAuth)?;
    String::from_utf8(plain).map_err(|_| SecurityError::CryptoAuth)
}

fn parse_envelope(rest: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = rest.splitn(4, ':');
    let version = parts
        .next()
        .ok_or_else(|| SecurityError::malformed_envelope("missing version"))?;
    if version != ENVELOPE_VERSION {
        return Err(SecurityError::malformed_envelope(format!(
            "unsupported version: {}",
            version
        )));
    }

    let nonce_b64 = parts
        .next()
        .ok_or_else(|| SecurityError::malformed_envelope("missing nonce"))?;
    let tag_b64 = parts
        .next()
        .ok_or_else(|| SecurityError::malformed_envelope("missing tag"))?;
    let payload_b64 = parts
        .next()
        .ok_or_else(|| SecurityError::malformed_envelope("missing payload"))?;

    let nonce = BASE64
        .decode(nonce_b64)
        .map_err(|e| SecurityError::malformed_envelope(format!("nonce: {}", e)))?;
    if nonce.len() != NONCE_LEN {
        return Err(SecurityError::malformed_envelope("nonce length"));
    }
    let tag = BASE64
        .decode(tag_b64)
        .map_err(|e| SecurityError::malformed_envelope(format!("tag: {}", e)))?;
    if tag.len() != TAG_LEN {
        return Err(SecurityError::malformed_envelope("tag length"));
    }
    let payload = BASE64
        .decode(payload_b64)
        .map_err(|e| SecurityError::malformed_envelope(format!("payload: {}", e)))?;

    Ok((nonce, tag, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY_A: &str = "6368616e676520746869732070617373776f726420746f206120736563726574";
    const KEY_B: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn vault(current: &str) -> CredentialVault {
        CredentialVault::new(Some(current), None).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let v = vault(KEY_A);
        let sealed = v.encrypt("sk_live_abc123").unwrap();
        assert!(sealed.starts_with("enc:v1:"));
        assert_eq!(v.decrypt(&sealed).unwrap(), "sk_live_abc123");
    }

    #[test]
    fn test_plaintext_passthrough() {
        let v = vault(KEY_A);
        assert_eq!(v.decrypt("sk_live_legacy").unwrap(), "sk_live_legacy");
    }

    #[test]
    fn test_missing_key_on_encrypted_value() {
        let v = CredentialVault::disabled();
        let err = v.decrypt("enc:v1:AAAA:BBBB:CCCC").unwrap_err();
        assert!(matches!(err, SecurityError::ConfigMissing));
    }

    #[test]
    fn test_rotation_fallback() {
        let old = vault(KEY_A);
        let sealed = old.encrypt("whsec_rotated").unwrap();

        let rotated = CredentialVault::new(Some(KEY_B), Some(KEY_A)).unwrap();
        assert_eq!(rotated.decrypt(&sealed).unwrap(), "whsec_rotated");

        // New writes use the current key only
        let resealed = rotated.encrypt("whsec_rotated").unwrap();
        let current_only = CredentialVault::new(Some(KEY_B), None).unwrap();
        assert_eq!(current_only.decrypt(&resealed).unwrap(), "whsec_rotated");
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let v = vault(KEY_A);
        let sealed = v.encrypt("secret").unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(String::from).collect();
        // Flip one byte inside the payload segment
        let mut payload = BASE64.decode(parts.last().unwrap()).unwrap();
        payload[0] ^= 0x01;
        let last = parts.len() - 1;
        parts[last] = BASE64.encode(&payload);
        let err = v.decrypt(&parts.join(":")).unwrap_err();
        assert!(matches!(err, SecurityError::CryptoAuth));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sealed = vault(KEY_A).encrypt("secret").unwrap();
        let err = vault(KEY_B).decrypt(&sealed).unwrap_err();
        assert!(matches!(err, SecurityError::CryptoAuth));
    }

    proptest! {
        #[test]
        fn prop_round_trip_printable_utf8(plaintext in "\\PC{0,256}") {
            let v = vault(KEY_A);
            let sealed = v.encrypt(&plaintext).unwrap();
            prop_assert_eq!(v.decrypt(&sealed).unwrap(), plaintext);
        }

        #[test]
        fn prop_tampering_any_payload_byte_fails(
            plaintext in "\\PC{1,64}",
            flip_bit in 0u8..8,
        ) {
            let v = vault(KEY_A);
            let sealed = v.encrypt(&plaintext).unwrap();
            let mut parts: Vec<String> = sealed.split(':').map(String::from).collect();
            let mut payload = BASE64.decode(parts.last().unwrap()).unwrap();
            let idx = payload.len() - 1;
            payload[idx] ^= 1 << flip_bit;
            let last = parts.len() - 1;
            parts[last] = BASE64.encode(&payload);
            prop_assert!(v.decrypt(&parts.join(":")).is_err());
        }
    }
}
