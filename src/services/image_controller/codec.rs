//! Codec adapter: decoding sources and preparing pixel buffers for upload

use image::DynamicImage;

use super::error::{ImageControllerError, Result};
use super::types::{Bitmap, ImageSource, PixelBuffer};

/// Turns sources into bitmaps and bitmaps into uploadable pixels.
pub trait Codec: Send + Sync {
    /// Decode a source into the canonical bitmap.
    fn decode(&self, source: &ImageSource) -> Result<Bitmap>;

    /// Convert a bitmap into the linear RGBA buffer the renderer expects.
    fn to_pixel_buffer(&self, bitmap: &Bitmap) -> Result<PixelBuffer>;
}

/// Codec backed by the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct ImageCodec {
    max_dimension: Option<u32>,
}

impl ImageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Downscale (keeping aspect ratio) anything larger than `max` on either
    /// side before it is uploaded. The cached bitmap keeps full resolution.
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = Some(max.max(1));
        self
    }
}

impl Codec for ImageCodec {
    fn decode(&self, source: &ImageSource) -> Result<Bitmap> {
        let bitmap = match source {
            ImageSource::Path(path) => {
                log::trace!("Decoding image file {:?}", path);
                image::open(path)?
            }
            ImageSource::Bytes(bytes) => {
                log::trace!("Decoding {} bytes of encoded image", bytes.len());
                image::load_from_memory(bytes)?
            }
            ImageSource::Bitmap(bitmap) => bitmap.clone(),
        };
        log::debug!(
            "Decoded {} ({}x{}, {:?})",
            source.describe(),
            bitmap.width(),
            bitmap.height(),
            bitmap.color()
        );
        Ok(bitmap)
    }

    fn to_pixel_buffer(&self, bitmap: &Bitmap) -> Result<PixelBuffer> {
        let rgba = match self.max_dimension {
            Some(max) if bitmap.width() > max || bitmap.height() > max => {
                log::trace!(
                    "Resizing from {}x{} to fit {}",
                    bitmap.width(),
                    bitmap.height(),
                    max
                );
                bitmap.thumbnail(max, max).to_rgba8()
            }
            _ => match bitmap {
                DynamicImage::ImageRgba8(rgba) => rgba.clone(),
                other => other.to_rgba8(),
            },
        };

        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(ImageControllerError::Conversion {
                fingerprint: String::new(),
                reason: "bitmap has no pixels".to_string(),
            });
        }
        PixelBuffer::new(width, height, rgba.into_raw())
    }
}
