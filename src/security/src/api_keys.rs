//! API key generation and lookup material
//!
//! Keys are `rev_{64-hex}`. Only the SHA-256 hash of the plaintext and an
//! 8-character prefix are ever persisted; the plaintext is handed to the
//! caller exactly once at creation time.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "rev_";
const PREFIX_LEN: usize = 8;

/// Freshly minted key: plaintext plus the two values that get stored
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub key_hash: String,
    pub key_prefix: String,
}

/// Mint a new API key
pub fn generate_api_key() -> GeneratedKey {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let plaintext = format!("{}{}", API_KEY_PREFIX, hex::encode(secret));
    GeneratedKey {
        key_hash: hash_api_key(&plaintext),
        key_prefix: plaintext[..PREFIX_LEN].to_string(),
        plaintext,
    }
}

/// SHA-256 hex digest of a presented key, used for the lookup
pub fn hash_api_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_api_key();
        assert!(key.plaintext.starts_with(API_KEY_PREFIX));
        assert_eq!(key.plaintext.len(), API_KEY_PREFIX.len() + 64);
        assert_eq!(key.key_prefix.len(), 8);
        assert!(key.plaintext.starts_with(&key.key_prefix));
        assert_eq!(key.key_hash.len(), 64);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let key = generate_api_key();
        assert_eq!(key.key_hash, hash_api_key(&key.plaintext));
    }

    #[test]
    fn test_keys_are_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a.plaintext, b.plaintext);
        assert_ne!(a.key_hash, b.key_hash);
    }
}
