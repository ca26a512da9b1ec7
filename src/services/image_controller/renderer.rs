//! Renderer adapter: the boundary to the GPU / graphics binding.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::prelude::*;

use super::error::{ImageControllerError, Result};
use super::types::PixelBuffer;

static NEXT_RENDER_HANDLE: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum HandleKind {
    Plug,
    Texture(u64),
}

/// Opaque handle to something the renderer can draw.
///
/// Either the shared texture plug or a texture produced by a loader worker.
/// The plug lives outside the id space, so no raw id can ever equal it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderHandle(HandleKind);

impl RenderHandle {
    /// Allocate a fresh process-unique texture handle.
    pub fn allocate() -> Self {
        Self(HandleKind::Texture(
            NEXT_RENDER_HANDLE.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Wrap an id issued by an external graphics binding. Any value is a
    /// texture id.
    pub fn from_raw(raw: u64) -> Self {
        Self(HandleKind::Texture(raw))
    }

    pub(crate) const fn placeholder() -> Self {
        Self(HandleKind::Plug)
    }

    /// Texture id, `None` for the plug.
    pub fn raw(&self) -> Option<u64> {
        match self.0 {
            HandleKind::Plug => None,
            HandleKind::Texture(raw) => Some(raw),
        }
    }

    pub fn is_plug(&self) -> bool {
        self.0 == HandleKind::Plug
    }
}

impl fmt::Debug for RenderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            HandleKind::Plug => write!(f, "RenderHandle(plug)"),
            HandleKind::Texture(raw) => write!(f, "RenderHandle({})", raw),
        }
    }
}

/// Uploads pixel buffers and releases the resulting textures.
///
/// Both calls may fail once the render context is torn down. Callers inside
/// the controller log such failures and carry on.
pub trait Renderer: Send + Sync {
    fn upload(&self, width: u32, height: u32, pixels: &PixelBuffer) -> Result<RenderHandle>;

    fn release(&self, handle: RenderHandle) -> Result<()>;
}

/// Headless renderer keeping "textures" in memory.
///
/// Useful for hosts without a GPU context and for exercising the controller.
#[derive(Default)]
pub struct MemoryRenderer {
    textures: DashMap<RenderHandle, usize>,
    uploads: AtomicU64,
    releases: AtomicU64,
    failing: AtomicBool,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail, as a lost render context would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Textures currently alive
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Bytes held by live textures
    pub fn memory_usage(&self) -> usize {
        self.textures.iter().map(|entry| *entry.value()).sum()
    }

    pub fn is_live(&self, handle: RenderHandle) -> bool {
        self.textures.contains_key(&handle)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Acquire)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }

    fn check_context(&self) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ImageControllerError::Renderer(
                "render context is gone".to_string(),
            ));
        }
        Ok(())
    }
}

impl Renderer for MemoryRenderer {
    fn upload(&self, width: u32, height: u32, pixels: &PixelBuffer) -> Result<RenderHandle> {
        self.check_context()?;
        if pixels.width != width || pixels.height != height {
            return Err(ImageControllerError::Renderer(format!(
                "upload of {}x{} got a {}x{} buffer",
                width, height, pixels.width, pixels.height
            )));
        }

        let handle = RenderHandle::allocate();
        self.textures.insert(handle, pixels.size());
        self.uploads.fetch_add(1, Ordering::AcqRel);
        log::trace!("Uploaded {}x{} texture as {:?}", width, height, handle);
        Ok(handle)
    }

    fn release(&self, handle: RenderHandle) -> Result<()> {
        if handle.is_plug() {
            return Ok(());
        }
        self.check_context()?;
        if self.textures.remove(&handle).is_none() {
            return Err(ImageControllerError::Renderer(format!(
                "{:?} is not a live texture",
                handle
            )));
        }
        self.releases.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::image_controller::plug::texture_plug;

    fn buffer(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::new(width, height, vec![0; (width * height * 4) as usize]).unwrap()
    }

    #[test]
    fn test_upload_and_release() {
        let renderer = MemoryRenderer::new();
        let handle = renderer.upload(2, 3, &buffer(2, 3)).unwrap();

        assert!(!handle.is_plug());
        assert!(renderer.is_live(handle));
        assert_eq!(renderer.memory_usage(), 24);

        renderer.release(handle).unwrap();
        assert_eq!(renderer.live_textures(), 0);
        assert_eq!(renderer.upload_count(), 1);
        assert_eq!(renderer.release_count(), 1);
    }

    #[test]
    fn test_double_release_fails() {
        let renderer = MemoryRenderer::new();
        let handle = renderer.upload(1, 1, &buffer(1, 1)).unwrap();
        renderer.release(handle).unwrap();
        assert!(renderer.release(handle).is_err());
    }

    #[test]
    fn test_releasing_plug_is_noop() {
        let renderer = MemoryRenderer::new();
        renderer.set_failing(true);
        assert!(renderer.release(texture_plug()).is_ok());
        assert_eq!(renderer.release_count(), 0);
    }

    #[test]
    fn test_failing_context() {
        let renderer = MemoryRenderer::new();
        renderer.set_failing(true);
        assert!(renderer.upload(1, 1, &buffer(1, 1)).is_err());
        renderer.set_failing(false);
        assert!(renderer.upload(1, 1, &buffer(1, 1)).is_ok());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let renderer = MemoryRenderer::new();
        assert!(renderer.upload(4, 4, &buffer(2, 2)).is_err());
        assert_eq!(renderer.live_textures(), 0);
    }
}
