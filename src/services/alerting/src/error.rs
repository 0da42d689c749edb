//! Error handling for alert delivery

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AlertError>;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Delivery failed with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Delivery transport error: {message}")]
    Transport { message: String },

    #[error("Circuit breaker rejected delivery: {0}")]
    Breaker(#[from] revwatch_breaker::BreakerError),

    #[error("Alert config for channel {channel} is incomplete: {message}")]
    Misconfigured { channel: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] revwatch_database::DatabaseError),
}

impl AlertError {
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn misconfigured<S: Into<String>>(channel: &str, message: S) -> Self {
        Self::Misconfigured {
            channel: channel.to_string(),
            message: message.into(),
        }
    }

    /// Misconfiguration and breaker rejections are not worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            AlertError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            AlertError::Transport { .. } => true,
            AlertError::Breaker(_) => false,
            AlertError::Misconfigured { .. } => false,
            AlertError::Storage(_) => true,
        }
    }
}

impl From<reqwest::Error> for AlertError {
    fn from(err: reqwest::Error) -> Self {
        AlertError::Transport {
            message: err.to_string(),
        }
    }
}
