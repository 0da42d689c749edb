//! Error types for security operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Error, Debug)]
pub enum SecurityError {
    /// An encrypted value was presented but no vault key is configured
    #[error("Credential encryption key not configured")]
    ConfigMissing,

    /// Decryption failed authentication (tampered or wrong-key ciphertext)
    #[error("Ciphertext failed authentication")]
    CryptoAuth,

    /// Key material is malformed (wrong length, bad hex)
    #[error("Invalid key material: {message}")]
    InvalidKey { message: String },

    /// A ciphertext envelope is structurally malformed
    #[error("Malformed ciphertext envelope: {message}")]
    MalformedEnvelope { message: String },

    /// A signature header is structurally malformed
    #[error("Malformed signature header: {message}")]
    MalformedSignature { message: String },
}

impl SecurityError {
    pub fn invalid_key<S: Into<String>>(message: S) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    pub fn malformed_envelope<S: Into<String>>(message: S) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
        }
    }

    pub fn malformed_signature<S: Into<String>>(message: S) -> Self {
        Self::MalformedSignature {
            message: message.into(),
        }
    }
}
