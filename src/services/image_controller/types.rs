//! Core types for the image controller

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use image::{ColorType, DynamicImage};
use sha2::{Digest, Sha256};

use crate::prelude::*;

use super::error::{ImageControllerError, Result};
use super::renderer::RenderHandle;

/// Canonical in-memory bitmap produced by the codec.
pub type Bitmap = DynamicImage;

/// Content-derived cache key (SHA-256).
///
/// Two sources with the same fingerprint are treated as the same cached
/// image. Collisions are an accepted risk of the hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint a source without decoding it.
    ///
    /// Paths hash the path string, byte streams hash their content, and
    /// in-memory bitmaps hash dimensions, color type and raw pixels so that
    /// two bitmaps with equal bytes but different layouts never collide.
    pub fn of(source: &ImageSource) -> Self {
        let mut hasher = Sha256::new();
        match source {
            ImageSource::Path(path) => {
                hasher.update(b"path:");
                hasher.update(path.to_string_lossy().as_bytes());
            }
            ImageSource::Bytes(bytes) => {
                hasher.update(b"bytes:");
                hasher.update(bytes);
            }
            ImageSource::Bitmap(bitmap) => {
                hasher.update(b"bitmap:");
                hasher.update(bitmap.width().to_le_bytes());
                hasher.update(bitmap.height().to_le_bytes());
                hasher.update([color_tag(bitmap.color())]);
                hasher.update(bitmap.as_bytes());
            }
        }
        Self(hasher.finalize().into())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

/// Fixed byte per pixel layout. Part of the fingerprint, so existing values
/// must never change.
fn color_tag(color: ColorType) -> u8 {
    match color {
        ColorType::L8 => 1,
        ColorType::La8 => 2,
        ColorType::Rgb8 => 3,
        ColorType::Rgba8 => 4,
        ColorType::L16 => 5,
        ColorType::La16 => 6,
        ColorType::Rgb16 => 7,
        ColorType::Rgba16 => 8,
        ColorType::Rgb32F => 9,
        ColorType::Rgba32F => 10,
        _ => 0,
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Where an image comes from.
#[derive(Clone)]
pub enum ImageSource {
    /// File on disk; the format is guessed from content and extension
    Path(PathBuf),
    /// Encoded image bytes (PNG, JPEG, ...)
    Bytes(Vec<u8>),
    /// Already decoded bitmap
    Bitmap(Bitmap),
}

impl ImageSource {
    /// Reject sources the codec cannot possibly take.
    pub fn validate(&self) -> Result<()> {
        match self {
            ImageSource::Path(path) => {
                if path.as_os_str().is_empty() {
                    return Err(ImageControllerError::InvalidSource(
                        "empty path".to_string(),
                    ));
                }
                if path.is_dir() {
                    return Err(ImageControllerError::InvalidSource(format!(
                        "{} is a directory",
                        path.display()
                    )));
                }
            }
            ImageSource::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(ImageControllerError::InvalidSource(
                        "empty byte stream".to_string(),
                    ));
                }
            }
            ImageSource::Bitmap(bitmap) => {
                if bitmap.width() == 0 || bitmap.height() == 0 {
                    return Err(ImageControllerError::InvalidSource(format!(
                        "bitmap has no pixels ({}x{})",
                        bitmap.width(),
                        bitmap.height()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Short human readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes(bytes) => format!("<{} encoded bytes>", bytes.len()),
            ImageSource::Bitmap(bitmap) => {
                format!("<bitmap {}x{}>", bitmap.width(), bitmap.height())
            }
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageSource({})", self.describe())
    }
}

impl From<&str> for ImageSource {
    fn from(path: &str) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<String> for ImageSource {
    fn from(path: String) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl From<Bitmap> for ImageSource {
    fn from(bitmap: Bitmap) -> Self {
        ImageSource::Bitmap(bitmap)
    }
}

/// Texture state of a cache entry.
///
/// Transitions only go `Unloaded -> Queued -> Loading -> Loaded -> Unloaded`.
/// `Queued` may fall back to `Unloaded` when the request goes stale and
/// `Loading` falls back to `Unloaded` when conversion fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    Unloaded,
    Queued,
    Loading,
    Loaded,
}

impl LoadState {
    pub fn name(&self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Queued => "queued",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_become(&self, next: LoadState) -> bool {
        matches!(
            (self, next),
            (LoadState::Unloaded, LoadState::Queued)
                | (LoadState::Queued, LoadState::Loading)
                | (LoadState::Queued, LoadState::Unloaded)
                | (LoadState::Loading, LoadState::Loaded)
                | (LoadState::Loading, LoadState::Unloaded)
                | (LoadState::Loaded, LoadState::Unloaded)
        )
    }
}

/// Linear RGBA8 pixels, row-major, ready for upload.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(ImageControllerError::Conversion {
                fingerprint: String::new(),
                reason: format!(
                    "pixel buffer has {} bytes, expected {} for {}x{}",
                    rgba.len(),
                    expected,
                    width,
                    height
                ),
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// Size of the buffer in bytes
    pub fn size(&self) -> usize {
        self.rgba.len()
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelBuffer({}x{}, {} bytes)", self.width, self.height, self.size())
    }
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Opaque token returned by `subscribe`, used only to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a subscriber sees: loaded or not, and the handle to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureState {
    pub is_loaded: bool,
    pub handle: RenderHandle,
}

impl TextureState {
    pub fn loaded(handle: RenderHandle) -> Self {
        Self {
            is_loaded: true,
            handle,
        }
    }

    pub fn unloaded() -> Self {
        Self {
            is_loaded: false,
            handle: super::plug::texture_plug(),
        }
    }
}

/// Counters describing the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    /// Entries currently in the store
    pub entries: usize,
    /// Entries holding a renderer texture
    pub loaded: usize,
    /// Requests waiting in the load queue
    pub queued: usize,
    /// Entries the evictor is watching
    pub tracked: usize,
    /// Successful conversions
    pub loads_completed: u64,
    /// Conversions that failed and fell back to the plug
    pub loads_failed: u64,
    /// Stale requests skipped at dequeue time
    pub loads_skipped: u64,
    /// Textures released because nobody looked at them
    pub evictions: u64,
    /// Requests pushed out of a full queue by newer ones
    pub enqueue_displaced: u64,
}
