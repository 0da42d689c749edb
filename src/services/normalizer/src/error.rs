//! Error handling for webhook normalization
//!
//! Normalizers fail closed: a structured failure here marks the webhook
//! log `failed` and is never retried; only transport/storage errors
//! upstream are retryable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NormalizerError>;

#[derive(Error, Debug)]
pub enum NormalizerError {
    #[error("Signature verification failed: {message}")]
    SignatureInvalid { message: String },

    #[error("Payload decode failed: {message}")]
    DecodeFailed { message: String },

    #[error("Unsupported payload shape: {message}")]
    UnsupportedPayload { message: String },
}

impl NormalizerError {
    pub fn signature_invalid<S: Into<String>>(message: S) -> Self {
        Self::SignatureInvalid {
            message: message.into(),
        }
    }

    pub fn decode_failed<S: Into<String>>(message: S) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedPayload {
            message: message.into(),
        }
    }

    /// Short machine-readable reason stored on the webhook log row
    pub fn reason_code(&self) -> &'static str {
        match self {
            NormalizerError::SignatureInvalid { .. } => "signature_invalid",
            NormalizerError::DecodeFailed { .. } => "decode_failed",
            NormalizerError::UnsupportedPayload { .. } => "decode_failed",
        }
    }
}

impl From<serde_json::Error> for NormalizerError {
    fn from(err: serde_json::Error) -> Self {
        NormalizerError::DecodeFailed {
            message: err.to_string(),
        }
    }
}
