//! Error types for the image controller

use std::io;
use thiserror::Error;

use crate::error::CommonError;

/// Result type for image controller operations
pub type Result<T> = std::result::Result<T, ImageControllerError>;

/// Errors that can occur in the image controller.
///
/// Only `InvalidSource` and `Decode` ever reach the caller of
/// [`ImageStore::resolve`](super::ImageStore::resolve). Conversion, renderer
/// and notification failures happen on background threads and are logged
/// and absorbed there.
#[derive(Error, Debug)]
pub enum ImageControllerError {
    /// The source is of a kind the controller cannot take
    #[error("Invalid image source: {0}")]
    InvalidSource(String),

    /// The source was recognised but could not be decoded
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// Decoding worked but building the pixel buffer failed
    #[error("Failed to convert image {fingerprint}: {reason}")]
    Conversion { fingerprint: String, reason: String },

    /// The render context refused an upload or release
    #[error("Renderer error: {0}")]
    Renderer(String),

    /// A subscriber's callback failed
    #[error("Notify target failed: {0}")]
    NotifyTarget(String),

    /// The entry already lost its last subscriber and left the store
    #[error("Image entry {0} is closed")]
    EntryClosed(String),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ImageControllerError {
    /// Errors about the input source, as opposed to background work.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            ImageControllerError::InvalidSource(_)
                | ImageControllerError::Decode(_)
                | ImageControllerError::Io(_)
        )
    }
}

impl From<anyhow::Error> for ImageControllerError {
    fn from(err: anyhow::Error) -> Self {
        ImageControllerError::NotifyTarget(format!("{:#}", err))
    }
}

impl From<ImageControllerError> for CommonError {
    fn from(err: ImageControllerError) -> Self {
        match err {
            ImageControllerError::Io(e) => CommonError::Io(e),
            ImageControllerError::InvalidSource(msg) => CommonError::InvalidInput(msg),
            ImageControllerError::Decode(e) => CommonError::InvalidFormat(e.to_string()),
            ImageControllerError::InvalidConfig(msg) => CommonError::InvalidConfig(msg),
            ImageControllerError::EntryClosed(fp) => CommonError::NotFound(fp),
            other => CommonError::Background(other.to_string()),
        }
    }
}
