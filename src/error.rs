//! Shared error categories for the image controller.
//!
//! Services define their own error enums; the categories here are the ones
//! every service can fall back to, so callers that only care about the broad
//! kind of failure can match on a single type.

use thiserror::Error;

/// Common error categories shared across services.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Background work failed: {0}")]
    Background(String),
}

impl CommonError {
    /// Whether the error describes bad caller input rather than a failure of
    /// background work.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CommonError::InvalidInput(_)
                | CommonError::InvalidFormat(_)
                | CommonError::InvalidConfig(_)
                | CommonError::NotFound(_)
        )
    }
}
