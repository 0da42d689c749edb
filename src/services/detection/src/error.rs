//! Error handling for the detection engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectionError>;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Storage error: {0}")]
    Storage(#[from] revwatch_database::DatabaseError),

    #[error("Detector '{detector}' failed: {message}")]
    Detector { detector: String, message: String },
}

impl DetectionError {
    pub fn detector<S: Into<String>>(detector: &str, message: S) -> Self {
        Self::Detector {
            detector: detector.to_string(),
            message: message.into(),
        }
    }
}
