//! Error handling for the storage layer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Query error: {message}")]
    Query { message: String },

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },
}

impl DatabaseError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn query<S: Into<String>>(message: S) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Whether the error is a unique-constraint violation
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatabaseError::Conflict { .. })
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::not_found("row"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                DatabaseError::conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => DatabaseError::Connection {
                message: err.to_string(),
            },
            _ => DatabaseError::Query {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization {
            message: err.to_string(),
        }
    }
}
