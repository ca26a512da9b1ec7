pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub(crate) mod evictor;
pub(crate) mod loader;
pub mod plug;
pub mod queue;
pub mod renderer;
pub mod store;
pub mod types;
pub mod viewer;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{Codec, ImageCodec};
pub use config::ControllerConfig;
pub use entry::{ImageEntry, NotifyTarget};
pub use error::{ImageControllerError, Result};
pub use plug::texture_plug;
pub use queue::{LoadQueue, PushOutcome};
pub use renderer::{MemoryRenderer, RenderHandle, Renderer};
pub use store::ImageStore;
pub use types::{
    Bitmap, Fingerprint, ImageSource, LoadState, PixelBuffer, StoreStatistics, SubscriptionHandle,
    TextureState,
};
pub use viewer::ImageViewer;
