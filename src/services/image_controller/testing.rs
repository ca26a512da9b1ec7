//! Fixtures shared by the controller tests.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

use crate::prelude::*;

use super::codec::{Codec, ImageCodec};
use super::config::ControllerConfig;
use super::entry::NotifyTarget;
use super::error::{ImageControllerError, Result};
use super::renderer::{MemoryRenderer, RenderHandle, Renderer};
use super::store::ImageStore;
use super::types::{Bitmap, ImageSource, PixelBuffer, TextureState};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn solid_bitmap(width: u32, height: u32, fill: u8) -> Bitmap {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([fill, fill, fill, 255])))
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut data = Vec::new();
    solid_bitmap(width, height, 128)
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .unwrap();
    data
}

pub(crate) fn png_file(dir: &TempDir, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, png_bytes(width, height)).unwrap();
    path
}

/// Synchronous mode, long idle timeout, fast poll.
pub(crate) fn sync_config() -> ControllerConfig {
    ControllerConfig::new()
        .with_inactivity_timeout(Duration::from_secs(30))
        .with_poll_interval(Duration::from_millis(10))
        .synchronous()
}

pub(crate) fn sync_store() -> (ImageStore, Arc<MemoryRenderer>, TempDir) {
    init_logging();
    let renderer = Arc::new(MemoryRenderer::new());
    let store = ImageStore::new(sync_config(), Arc::new(ImageCodec::new()), renderer.clone()).unwrap();
    (store, renderer, tempfile::tempdir().unwrap())
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Records every notification it gets.
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<TextureState>>>,
    sender: Sender<TextureState>,
    receiver: Receiver<TextureState>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            sender,
            receiver,
        }
    }

    pub(crate) fn target(&self) -> Arc<dyn NotifyTarget> {
        let events = self.events.clone();
        let sender = self.sender.clone();
        Arc::new(move |is_loaded: bool, handle: RenderHandle| -> anyhow::Result<()> {
            let state = TextureState { is_loaded, handle };
            events.lock().push(state);
            let _ = sender.send(state);
            Ok(())
        })
    }

    pub(crate) fn events(&self) -> Vec<TextureState> {
        self.events.lock().clone()
    }

    /// Next notification not yet taken, waiting up to `timeout`.
    pub(crate) fn next_event(&self, timeout: Duration) -> Option<TextureState> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// `ImageCodec` that counts its calls.
#[derive(Default)]
pub(crate) struct CountingCodec {
    inner: ImageCodec,
    decodes: AtomicUsize,
    conversions: AtomicUsize,
}

impl CountingCodec {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }
}

impl Codec for CountingCodec {
    fn decode(&self, source: &ImageSource) -> Result<Bitmap> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        // Widen the window for concurrent resolves.
        std::thread::sleep(Duration::from_millis(5));
        self.inner.decode(source)
    }

    fn to_pixel_buffer(&self, bitmap: &Bitmap) -> Result<PixelBuffer> {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        self.inner.to_pixel_buffer(bitmap)
    }
}

/// Decodes fine, then blows up while converting.
pub(crate) struct FailingCodec {
    inner: ImageCodec,
}

impl FailingCodec {
    pub(crate) fn panicking() -> Self {
        Self {
            inner: ImageCodec::new(),
        }
    }
}

impl Codec for FailingCodec {
    fn decode(&self, source: &ImageSource) -> Result<Bitmap> {
        self.inner.decode(source)
    }

    fn to_pixel_buffer(&self, _bitmap: &Bitmap) -> Result<PixelBuffer> {
        panic!("pixel conversion exploded")
    }
}

/// Renderer handing out small ids from zero through `RenderHandle::from_raw`,
/// the way an external graphics binding would.
#[derive(Default)]
pub(crate) struct RawIdRenderer {
    next: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl RawIdRenderer {
    pub(crate) fn live_textures(&self) -> usize {
        self.live.lock().len()
    }
}

impl Renderer for RawIdRenderer {
    fn upload(&self, _width: u32, _height: u32, _pixels: &PixelBuffer) -> Result<RenderHandle> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(id);
        Ok(RenderHandle::from_raw(id))
    }

    fn release(&self, handle: RenderHandle) -> Result<()> {
        let id = handle
            .raw()
            .ok_or_else(|| ImageControllerError::Renderer("released the plug".to_string()))?;
        if self.live.lock().remove(&id) {
            Ok(())
        } else {
            Err(ImageControllerError::Renderer(format!("{} is not live", id)))
        }
    }
}
