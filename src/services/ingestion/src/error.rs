//! Error handling for the ingestion pipeline
//!
//! The retry policy keys off [`IngestionError::is_retryable`]: storage and
//! queue failures are transient and requeue with backoff; normalization
//! failures are final and mark the webhook log `failed`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestionError>;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Storage error: {0}")]
    Storage(#[from] revwatch_database::DatabaseError),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Normalization failed: {0}")]
    Normalize(#[from] revwatch_normalizer::NormalizerError),

    #[error("Unknown billing connection for org {org_id} source {billing_source}")]
    UnknownConnection {
        org_id: uuid::Uuid,
        billing_source: revwatch_shared::Source,
    },

    #[error("Job timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl IngestionError {
    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Storage(_) => true,
            IngestionError::Queue { .. } => true,
            IngestionError::Timeout { .. } => true,
            IngestionError::Normalize(_) => false,
            IngestionError::UnknownConnection { .. } => false,
        }
    }
}

impl From<redis::RedisError> for IngestionError {
    fn from(err: redis::RedisError) -> Self {
        IngestionError::Queue {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        IngestionError::Queue {
            message: format!("job serialization: {}", err),
        }
    }
}
