//! Error handling for backfill runs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackfillError>;

#[derive(Error, Debug)]
pub enum BackfillError {
    /// Another run already holds the lock for this (source, org)
    #[error("Backfill already running for {source} on org {org_id}")]
    AlreadyRunning {
        source: revwatch_shared::Source,
        org_id: uuid::Uuid,
    },

    #[error("Backfill cancelled")]
    Cancelled,

    #[error("Provider API error ({status}): {body}")]
    ProviderApi { status: u16, body: String },

    #[error("Provider transport error: {message}")]
    Transport { message: String },

    #[error("Circuit breaker rejected provider call: {0}")]
    Breaker(#[from] revwatch_breaker::BreakerError),

    #[error("Connection credentials unusable: {message}")]
    Credentials { message: String },

    #[error("No {source} connection configured for org")]
    MissingConnection { source: revwatch_shared::Source },

    #[error("Backfill is not supported for {source}")]
    Unsupported { source: revwatch_shared::Source },

    #[error("Storage error: {0}")]
    Storage(#[from] revwatch_database::DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] revwatch_ingestion::IngestionError),

    #[error("Coordination error: {message}")]
    Coordination { message: String },
}

impl BackfillError {
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn credentials<S: Into<String>>(message: S) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    pub fn coordination<S: Into<String>>(message: S) -> Self {
        Self::Coordination {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BackfillError {
    fn from(err: reqwest::Error) -> Self {
        BackfillError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for BackfillError {
    fn from(err: redis::RedisError) -> Self {
        BackfillError::Coordination {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BackfillError {
    fn from(err: serde_json::Error) -> Self {
        BackfillError::Coordination {
            message: format!("serialization: {}", err),
        }
    }
}
