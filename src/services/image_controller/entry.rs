//! Cache entry: one decoded image, its texture state and its subscribers.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::prelude::*;

use super::error::{ImageControllerError, Result};
use super::plug::texture_plug;
use super::queue::PushOutcome;
use super::renderer::{RenderHandle, Renderer};
use super::store::StoreShared;
use super::types::{Bitmap, Fingerprint, LoadState, SubscriptionHandle, TextureState};

/// Something that wants to hear about texture changes of an entry.
///
/// Called from whatever thread changed the state, usually a loader worker or
/// the evictor, so implementations must be thread safe and must not block.
/// Errors and panics are logged by the entry and never reach other
/// subscribers.
pub trait NotifyTarget: Send + Sync {
    fn notify(&self, is_loaded: bool, handle: RenderHandle) -> anyhow::Result<()>;
}

impl<F> NotifyTarget for F
where
    F: Fn(bool, RenderHandle) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, is_loaded: bool, handle: RenderHandle) -> anyhow::Result<()> {
        self(is_loaded, handle)
    }
}

type Subscribers = Vec<(SubscriptionHandle, Arc<dyn NotifyTarget>)>;

/// Result of asking an entry whether the evictor may unload it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepOutcome {
    /// Texture released
    Evicted,
    /// Still in use, check again next pass
    Keep,
    /// The tracking token no longer matches; forget this record
    Stale,
}

struct EntryState {
    bitmap: Option<Arc<Bitmap>>,
    render_handle: RenderHandle,
    load_state: LoadState,
    last_visible: Instant,
    subscribers: BTreeMap<SubscriptionHandle, Arc<dyn NotifyTarget>>,
    // Bumped on every publish and unload; the evictor compares it against
    // the token it recorded so an old record never unloads a fresh texture.
    generation: u64,
    closed: bool,
}

impl EntryState {
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        match self.bitmap {
            Some(_) => now.saturating_duration_since(self.last_visible) > timeout,
            None => true,
        }
    }

    fn snapshot_subscribers(&self) -> Subscribers {
        self.subscribers
            .iter()
            .map(|(handle, target)| (*handle, target.clone()))
            .collect()
    }

    fn texture_state(&self) -> TextureState {
        if self.load_state == LoadState::Loaded {
            TextureState::loaded(self.render_handle)
        } else {
            TextureState::unloaded()
        }
    }

    /// Loaded -> Unloaded, handing back the texture to release.
    fn take_texture(&mut self) -> RenderHandle {
        let old = std::mem::replace(&mut self.render_handle, texture_plug());
        self.load_state = LoadState::Unloaded;
        self.generation += 1;
        old
    }
}

/// One cached image.
///
/// Created by [`ImageStore::resolve`](super::ImageStore::resolve) with the
/// bitmap already decoded; only the texture upload is deferred. The entry
/// leaves the store when its last subscriber goes away.
pub struct ImageEntry {
    fingerprint: Fingerprint,
    width: u32,
    height: u32,
    inactivity_timeout: Duration,
    renderer: Arc<dyn Renderer>,
    store: Weak<StoreShared>,
    state: Mutex<EntryState>,
    // Held across every state change that notifies, so subscribers see
    // changes of one entry in the order they happened. Re-entrant because a
    // callback may unsubscribe and thereby unload.
    delivery: ReentrantMutex<()>,
}

impl ImageEntry {
    pub(crate) fn new(fingerprint: Fingerprint, bitmap: Bitmap, store: &Arc<StoreShared>) -> Arc<Self> {
        Arc::new(Self {
            fingerprint,
            width: bitmap.width(),
            height: bitmap.height(),
            inactivity_timeout: store.config.inactivity_timeout,
            renderer: store.renderer.clone(),
            store: Arc::downgrade(store),
            state: Mutex::new(EntryState {
                bitmap: Some(Arc::new(bitmap)),
                render_handle: texture_plug(),
                load_state: LoadState::Unloaded,
                last_visible: Instant::now(),
                subscribers: BTreeMap::new(),
                generation: 0,
                closed: false,
            }),
            delivery: ReentrantMutex::new(()),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn load_state(&self) -> LoadState {
        self.state.lock().load_state
    }

    /// Current handle: the plug unless a texture is loaded.
    pub fn render_handle(&self) -> RenderHandle {
        self.state.lock().render_handle
    }

    pub fn state(&self) -> TextureState {
        self.state.lock().texture_state()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// The decoded bitmap, until the last subscriber leaves.
    pub fn bitmap(&self) -> Option<Arc<Bitmap>> {
        self.state.lock().bitmap.clone()
    }

    pub fn last_visible(&self) -> Instant {
        self.state.lock().last_visible
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// True once the last subscriber left; a closed entry never loads again.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether nobody has seen the image for longer than the timeout.
    /// Entries that lost their bitmap always count as idle.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.state.lock().is_idle(now, self.inactivity_timeout)
    }

    /// Record a visibility tick and request a texture if there is none.
    ///
    /// Never blocks. When the load queue is full the oldest pending request
    /// is dropped instead; whoever loses out simply asks again on its next
    /// tick.
    pub fn mark_visible(self: &Arc<Self>) {
        let Some(store) = self.store.upgrade() else {
            self.state.lock().last_visible = Instant::now();
            return;
        };

        let outcome = {
            let mut state = self.state.lock();
            state.last_visible = Instant::now();
            if state.load_state != LoadState::Unloaded || state.closed || state.bitmap.is_none() {
                return;
            }
            state.load_state = LoadState::Queued;
            store.queue.push(self.clone())
        };

        log::trace!("Queued {:?} for loading", self.fingerprint);
        if let PushOutcome::Displaced(stale) = outcome {
            store.counters.record_displaced();
            if stale.cancel_queued() {
                log::trace!("Dropped stale load request for {:?}", stale.fingerprint);
            }
        }
    }

    /// Add a subscriber. It is not notified right away; it should read
    /// [`state`](Self::state) or report visibility.
    pub fn subscribe(&self, target: Arc<dyn NotifyTarget>) -> Result<SubscriptionHandle> {
        self.subscribe_synced(target, |_| {})
    }

    /// Subscribe and hand the current state to `sync` before any
    /// notification can reach the new subscriber.
    pub(crate) fn subscribe_synced(
        &self,
        target: Arc<dyn NotifyTarget>,
        sync: impl FnOnce(TextureState),
    ) -> Result<SubscriptionHandle> {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Err(ImageControllerError::EntryClosed(self.fingerprint.to_string()));
        }
        let handle = SubscriptionHandle::next();
        state.subscribers.insert(handle, target);
        let current = state.texture_state();
        drop(state);

        sync(current);
        Ok(handle)
    }

    /// Remove a subscriber.
    ///
    /// When the last one leaves, the bitmap is released, the entry asks the
    /// store to forget it and any loaded texture is unloaded. Returns whether
    /// this call closed the entry.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let _delivery = self.delivery.lock();
        let old_texture = {
            let mut state = self.state.lock();
            if state.subscribers.remove(&handle).is_none() {
                return false;
            }
            if !state.subscribers.is_empty() || state.closed {
                return false;
            }
            state.closed = true;
            // A worker in the middle of a conversion holds its own reference;
            // the pixels go away once it finishes.
            state.bitmap = None;
            match state.load_state {
                LoadState::Loaded => Some(state.take_texture()),
                LoadState::Queued => {
                    state.load_state = LoadState::Unloaded;
                    None
                }
                LoadState::Unloaded | LoadState::Loading => None,
            }
        };

        if let Some(store) = self.store.upgrade() {
            store.remove(&self.fingerprint, self);
        }
        if let Some(texture) = old_texture {
            self.release_texture(texture);
        }
        log::debug!("Closed {:?} after its last subscriber left", self.fingerprint);
        true
    }

    /// Release the texture and fall back to the plug. No-op unless loaded.
    pub fn unload(&self) -> bool {
        let _delivery = self.delivery.lock();
        let (old_texture, subscribers) = {
            let mut state = self.state.lock();
            if state.load_state != LoadState::Loaded {
                return false;
            }
            (state.take_texture(), state.snapshot_subscribers())
        };

        self.deliver(&subscribers, TextureState::unloaded());
        self.release_texture(old_texture);
        log::debug!("Unloaded {:?}", self.fingerprint);
        true
    }

    /// Unload if the entry is still tracked under `token` and idle at `now`.
    pub(crate) fn unload_if_idle(&self, token: u64, now: Instant) -> SweepOutcome {
        let _delivery = self.delivery.lock();
        let (old_texture, subscribers) = {
            let mut state = self.state.lock();
            if state.generation != token || state.load_state != LoadState::Loaded {
                return SweepOutcome::Stale;
            }
            if !state.is_idle(now, self.inactivity_timeout) {
                return SweepOutcome::Keep;
            }
            (state.take_texture(), state.snapshot_subscribers())
        };

        self.deliver(&subscribers, TextureState::unloaded());
        self.release_texture(old_texture);
        log::debug!("Evicted idle texture of {:?}", self.fingerprint);
        SweepOutcome::Evicted
    }

    /// Queued -> Unloaded for a request that was pushed out of the queue.
    pub(crate) fn cancel_queued(&self) -> bool {
        let mut state = self.state.lock();
        if state.load_state == LoadState::Queued {
            state.load_state = LoadState::Unloaded;
            true
        } else {
            false
        }
    }

    /// Claim the entry for conversion: Queued -> Loading.
    ///
    /// Returns the bitmap to convert, or `None` when the request went stale
    /// while it waited (already loaded, unloaded, closed, or idle by now).
    pub(crate) fn begin_loading(&self, now: Instant) -> Option<Arc<Bitmap>> {
        let mut state = self.state.lock();
        if state.load_state != LoadState::Queued {
            return None;
        }
        if state.closed || state.is_idle(now, self.inactivity_timeout) {
            state.load_state = LoadState::Unloaded;
            return None;
        }
        let bitmap = state.bitmap.clone()?;
        state.load_state = LoadState::Loading;
        Some(bitmap)
    }

    /// Loading -> Unloaded after a failed conversion.
    pub(crate) fn abort_loading(&self) {
        let mut state = self.state.lock();
        if state.load_state == LoadState::Loading {
            state.load_state = LoadState::Unloaded;
        }
    }

    /// Publish a freshly uploaded texture: Loading -> Loaded.
    ///
    /// Notifies every subscriber and hands the entry to the evictor. If the
    /// entry was closed while converting, the texture is released at once.
    pub(crate) fn publish_loaded(self: &Arc<Self>, handle: RenderHandle) -> bool {
        let _delivery = self.delivery.lock();
        let published = {
            let mut state = self.state.lock();
            if state.load_state != LoadState::Loading {
                None
            } else if state.closed {
                state.load_state = LoadState::Unloaded;
                None
            } else {
                state.load_state = LoadState::Loaded;
                state.render_handle = handle;
                state.generation += 1;
                Some((state.generation, state.snapshot_subscribers()))
            }
        };

        let Some((generation, subscribers)) = published else {
            log::debug!("Discarding texture for {:?}, nobody wants it anymore", self.fingerprint);
            self.release_texture(handle);
            return false;
        };

        if let Some(store) = self.store.upgrade() {
            store.tracker.track(self.clone(), generation);
        }
        self.deliver(&subscribers, TextureState::loaded(handle));
        true
    }

    fn deliver(&self, subscribers: &Subscribers, change: TextureState) {
        for (handle, target) in subscribers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                target.notify(change.is_loaded, change.handle)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let err = ImageControllerError::from(err);
                    log::warn!(
                        "Subscriber {} of {:?} failed: {}",
                        handle.id(),
                        self.fingerprint,
                        err
                    );
                }
                Err(payload) => {
                    log::error!(
                        "Subscriber {} of {:?} panicked: {}",
                        handle.id(),
                        self.fingerprint,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }

    fn release_texture(&self, handle: RenderHandle) {
        if handle.is_plug() {
            return;
        }
        if let Err(err) = self.renderer.release(handle) {
            log::warn!("Failed to release texture of {:?}: {}", self.fingerprint, err);
        }
    }
}

impl Drop for ImageEntry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.load_state == LoadState::Loaded {
            let handle = state.take_texture();
            self.release_texture(handle);
        }
    }
}

impl fmt::Debug for ImageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ImageEntry")
            .field("fingerprint", &self.fingerprint)
            .field("size", &(self.width, self.height))
            .field("load_state", &state.load_state)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
