//! Viewer: scoped consumer of one cached image.

use std::fmt;

use crate::prelude::*;

use super::entry::{ImageEntry, NotifyTarget};
use super::error::{ImageControllerError, Result};
use super::renderer::RenderHandle;
use super::store::ImageStore;
use super::types::{Fingerprint, ImageSource, SubscriptionHandle, TextureState};

// How often a resolve is retried when it races with the last unsubscribe of
// the same image.
const RESOLVE_ATTEMPTS: usize = 3;

/// Receives notifications for the viewer and keeps the latest state.
struct ViewerSlot {
    state: Mutex<TextureState>,
    forward: Option<Arc<dyn NotifyTarget>>,
}

impl NotifyTarget for ViewerSlot {
    fn notify(&self, is_loaded: bool, handle: RenderHandle) -> anyhow::Result<()> {
        *self.state.lock() = TextureState { is_loaded, handle };
        match &self.forward {
            Some(forward) => forward.notify(is_loaded, handle),
            None => Ok(()),
        }
    }
}

/// Holds a subscription to one entry for as long as it lives.
///
/// Dropping the viewer unsubscribes, so the texture and bitmap are released
/// as soon as the last viewer of an image goes away, whichever way it goes.
pub struct ImageViewer {
    entry: Arc<ImageEntry>,
    subscription: Option<SubscriptionHandle>,
    slot: Arc<ViewerSlot>,
    requested_size: (Option<u32>, Option<u32>),
}

impl ImageViewer {
    pub fn open(store: &ImageStore, source: impl Into<ImageSource>) -> Result<Self> {
        Self::attach(store, &source.into(), None)
    }

    /// Like [`open`](Self::open), additionally forwarding every notification
    /// to `callback` (called from loader or evictor threads).
    pub fn with_callback(
        store: &ImageStore,
        source: impl Into<ImageSource>,
        callback: Arc<dyn NotifyTarget>,
    ) -> Result<Self> {
        Self::attach(store, &source.into(), Some(callback))
    }

    fn attach(
        store: &ImageStore,
        source: &ImageSource,
        forward: Option<Arc<dyn NotifyTarget>>,
    ) -> Result<Self> {
        let (entry, subscription, slot) = subscribe_to(store, source, forward)?;
        Ok(Self {
            entry,
            subscription: Some(subscription),
            slot,
            requested_size: (None, None),
        })
    }

    /// Report that the image is on screen.
    pub fn mark_visible(&self) {
        self.entry.mark_visible();
    }

    /// Handle to draw: the texture when loaded, otherwise the plug.
    pub fn texture(&self) -> RenderHandle {
        self.slot.state.lock().handle
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.state.lock().is_loaded
    }

    pub fn state(&self) -> TextureState {
        *self.slot.state.lock()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.entry.fingerprint()
    }

    pub fn entry(&self) -> &Arc<ImageEntry> {
        &self.entry
    }

    /// Show a different image. The new one is subscribed before the old one
    /// is let go, so switching between views of one image never drops it.
    pub fn set_source(&mut self, store: &ImageStore, source: impl Into<ImageSource>) -> Result<()> {
        let forward = self.slot.forward.clone();
        let (entry, subscription, slot) = subscribe_to(store, &source.into(), forward)?;

        let old_entry = std::mem::replace(&mut self.entry, entry);
        let old_subscription = self.subscription.replace(subscription);
        self.slot = slot;
        if let Some(handle) = old_subscription {
            old_entry.unsubscribe(handle);
        }
        Ok(())
    }

    /// Requested display size. With only one side given the other follows
    /// the image's aspect ratio.
    pub fn set_size(&mut self, width: Option<u32>, height: Option<u32>) {
        self.requested_size = (width, height);
    }

    pub fn display_size(&self) -> (u32, u32) {
        let (natural_w, natural_h) = (self.entry.width(), self.entry.height());
        match self.requested_size {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, scale(w, natural_h, natural_w)),
            (None, Some(h)) => (scale(h, natural_w, natural_h), h),
            (None, None) => (natural_w, natural_h),
        }
    }

    /// Unsubscribe now instead of on drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.subscription.take() {
            self.entry.unsubscribe(handle);
        }
    }
}

impl Drop for ImageViewer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ImageViewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageViewer")
            .field("fingerprint", &self.entry.fingerprint())
            .field("state", &self.state())
            .field("display_size", &self.display_size())
            .finish()
    }
}

fn subscribe_to(
    store: &ImageStore,
    source: &ImageSource,
    forward: Option<Arc<dyn NotifyTarget>>,
) -> Result<(Arc<ImageEntry>, SubscriptionHandle, Arc<ViewerSlot>)> {
    let mut last_error = None;
    for _ in 0..RESOLVE_ATTEMPTS {
        let (_, entry) = store.resolve_source(source)?;
        let slot = Arc::new(ViewerSlot {
            state: Mutex::new(TextureState::unloaded()),
            forward: forward.clone(),
        });
        let target: Arc<dyn NotifyTarget> = slot.clone();
        let subscribed = entry.subscribe_synced(target, |current| {
            *slot.state.lock() = current;
        });
        match subscribed {
            Ok(handle) => return Ok((entry, handle, slot)),
            Err(err @ ImageControllerError::EntryClosed(_)) => {
                log::debug!("{:?} closed while subscribing, resolving again", entry.fingerprint());
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        ImageControllerError::EntryClosed(format!("{:?}", source))
    }))
}

// `target * numerator / denominator`, rounded, at least 1.
fn scale(target: u32, numerator: u32, denominator: u32) -> u32 {
    if denominator == 0 {
        return target;
    }
    let scaled = (u64::from(target) * u64::from(numerator) + u64::from(denominator) / 2)
        / u64::from(denominator);
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}
