//! API error surface
//!
//! One taxonomy for the whole HTTP layer. 4xx responses carry `error`
//! plus optional `details`; 5xx responses carry a correlation id that is
//! also attached to the server-side log line.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation failed: {message}")]
    Validation { message: String, details: Option<Value> },

    #[error("Unauthorized: {message}")]
    Auth { message: String },

    #[error("Forbidden: missing scope {scope}")]
    Scope { scope: &'static str },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String, details: Option<Value> },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Dependency unavailable: {service}")]
    Dependency { service: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with<S: Into<String>>(message: S, details: Value) -> Self {
        Self::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict_with<S: Into<String>>(message: S, details: Value) -> Self {
        Self::Conflict {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Auth { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Scope { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Dependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            ApiError::Validation { message, details }
            | ApiError::Conflict { message, details } => {
                let mut payload = json!({ "error": message });
                if let Some(details) = details {
                    payload["details"] = details.clone();
                }
                payload
            }
            ApiError::Internal { message } | ApiError::Dependency { service: message } => {
                let correlation_id = Uuid::new_v4();
                error!(correlation_id = %correlation_id, error = %message, "request failed");
                json!({
                    "error": self.to_string(),
                    "correlationId": correlation_id,
                })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<revwatch_database::DatabaseError> for ApiError {
    fn from(err: revwatch_database::DatabaseError) -> Self {
        use revwatch_database::DatabaseError;
        match err {
            DatabaseError::NotFound { entity } => ApiError::not_found(entity),
            DatabaseError::Conflict { message } => ApiError::conflict(message),
            DatabaseError::Connection { message } => ApiError::Dependency {
                service: format!("database: {}", message),
            },
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<revwatch_ingestion::IngestionError> for ApiError {
    fn from(err: revwatch_ingestion::IngestionError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<revwatch_security::SecurityError> for ApiError {
    fn from(err: revwatch_security::SecurityError) -> Self {
        ApiError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::auth("x").status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Scope { scope: "issues:read" }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::not_found("issue").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::RateLimit.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }
}
