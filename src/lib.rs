#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! Lifecycle controller for large decoded images displayed transiently in a
//! graphical interface.
//!
//! Decoded images are cached by content fingerprint and shared between
//! viewers. Textures are produced on demand by a bounded pool of loader
//! workers and released again by an evictor once nobody has seen the image
//! for a while. The controller never draws; it only decides whether a
//! renderer-owned texture exists and tells subscribers when that changes.

pub mod error;
pub(crate) mod prelude;
pub mod types;

pub mod services;

pub use error::CommonError;
pub use types::Timer;

pub use services::image_controller::{
    texture_plug, Bitmap, Codec, ControllerConfig, Fingerprint, ImageCodec, ImageControllerError,
    ImageEntry, ImageSource, ImageStore, ImageViewer, LoadState, MemoryRenderer, NotifyTarget,
    PixelBuffer, RenderHandle, Renderer, StoreStatistics, SubscriptionHandle, TextureState,
};
