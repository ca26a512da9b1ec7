//! Cache store: the fingerprint to entry map and the background machinery.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;

use crate::prelude::*;

use super::codec::{Codec, ImageCodec};
use super::config::ControllerConfig;
use super::entry::ImageEntry;
use super::error::Result;
use super::evictor::{self, Evictor, IdleTracker};
use super::loader::{self, LoadOutcome, LoaderPool};
use super::queue::LoadQueue;
use super::renderer::Renderer;
use super::types::{Fingerprint, ImageSource, LoadState, StoreStatistics};

/// Running totals reported through [`StoreStatistics`].
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    loads_skipped: AtomicU64,
    evictions: AtomicU64,
    enqueue_displaced: AtomicU64,
}

impl StoreCounters {
    pub(crate) fn record(&self, outcome: LoadOutcome) {
        let counter = match outcome {
            LoadOutcome::Loaded => &self.loads_completed,
            LoadOutcome::Failed => &self.loads_failed,
            LoadOutcome::Skipped => &self.loads_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_displaced(&self) {
        self.enqueue_displaced.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between the store handle, its entries and the background
/// threads. Entries only keep a weak reference to it.
pub(crate) struct StoreShared {
    /// Tunables, fixed at construction
    pub(crate) config: ControllerConfig,

    /// Fingerprint -> entry; the only place entries are inserted or removed
    pub(crate) entries: DashMap<Fingerprint, Arc<ImageEntry>>,

    /// One gate per fingerprint being decoded right now
    decoding: DashMap<Fingerprint, Arc<Mutex<()>>>,

    pub(crate) codec: Arc<dyn Codec>,

    pub(crate) renderer: Arc<dyn Renderer>,

    /// Pending conversions, newest on top
    pub(crate) queue: LoadQueue<Arc<ImageEntry>>,

    /// Loaded entries the evictor watches
    pub(crate) tracker: IdleTracker,

    pub(crate) counters: StoreCounters,
}

impl StoreShared {
    /// Forget `entry` if it is still the one stored under `fingerprint`.
    /// A newer entry under the same fingerprint is left alone.
    pub(crate) fn remove(&self, fingerprint: &Fingerprint, entry: &ImageEntry) -> bool {
        self.entries
            .remove_if(fingerprint, |_, stored| std::ptr::eq(Arc::as_ptr(stored), entry))
            .is_some()
    }
}

struct Background {
    loader: LoaderPool,
    evictor: Evictor,
}

/// Content-addressed cache of decoded images.
///
/// Resolving the same source twice yields the same [`ImageEntry`] and decodes
/// only once. Textures are created in the background when an entry reports
/// visibility, and released again once it has been idle for the configured
/// timeout. In synchronous mode there are no background threads and the host
/// drives both sides with [`drain_loads`](Self::drain_loads) and
/// [`drain_unloads`](Self::drain_unloads).
pub struct ImageStore {
    shared: Arc<StoreShared>,
    background: Mutex<Option<Background>>,
    unload_timer: Mutex<Timer>,
}

impl ImageStore {
    pub fn new(
        config: ControllerConfig,
        codec: Arc<dyn Codec>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(StoreShared {
            queue: LoadQueue::new(config.effective_queue_capacity()),
            entries: DashMap::new(),
            decoding: DashMap::new(),
            codec,
            renderer,
            tracker: IdleTracker::default(),
            counters: StoreCounters::default(),
            config,
        });

        let store = Self {
            shared,
            background: Mutex::new(None),
            unload_timer: Mutex::new(Timer::start()),
        };

        if !store.shared.config.synchronous_mode {
            store.start_background()?;
        }

        log::info!(
            "Image store ready ({} workers, queue {}, timeout {:?}, poll {:?}{})",
            store.shared.config.worker_count,
            store.shared.queue.capacity(),
            store.shared.config.inactivity_timeout,
            store.shared.config.poll_interval,
            if store.shared.config.synchronous_mode { ", synchronous" } else { "" }
        );
        Ok(store)
    }

    /// Store with the default configuration and the `image` backed codec.
    pub fn with_defaults(renderer: Arc<dyn Renderer>) -> Result<Self> {
        Self::new(ControllerConfig::default(), Arc::new(ImageCodec::new()), renderer)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Look up or create the entry for `source`.
    ///
    /// The source is decoded only when its fingerprint is new. Bad input
    /// fails with `InvalidSource` or `Decode` and inserts nothing.
    pub fn resolve(&self, source: impl Into<ImageSource>) -> Result<(Fingerprint, Arc<ImageEntry>)> {
        self.resolve_source(&source.into())
    }

    pub fn resolve_source(&self, source: &ImageSource) -> Result<(Fingerprint, Arc<ImageEntry>)> {
        source.validate()?;
        let fingerprint = Fingerprint::of(source);

        if let Some(entry) = self.live_entry(&fingerprint) {
            log::trace!("Reusing {:?} for {}", fingerprint, source.describe());
            return Ok((fingerprint, entry));
        }

        // Concurrent resolves of one fingerprint queue up on its gate so only
        // the first decodes. No map shard is held while the codec runs.
        let gate = self
            .shared
            .decoding
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let resolved = {
            let _decoding = gate.lock();
            self.decode_and_insert(fingerprint, source)
        };
        self.shared
            .decoding
            .remove_if(&fingerprint, |_, current| Arc::ptr_eq(current, &gate));
        resolved
    }

    fn live_entry(&self, fingerprint: &Fingerprint) -> Option<Arc<ImageEntry>> {
        self.shared
            .entries
            .get(fingerprint)
            .map(|entry| entry.value().clone())
            .filter(|entry| !entry.is_closed())
    }

    fn decode_and_insert(
        &self,
        fingerprint: Fingerprint,
        source: &ImageSource,
    ) -> Result<(Fingerprint, Arc<ImageEntry>)> {
        if let Some(entry) = self.live_entry(&fingerprint) {
            log::trace!("Reusing {:?} for {}", fingerprint, source.describe());
            return Ok((fingerprint, entry));
        }

        let bitmap = self.shared.codec.decode(source).map_err(|err| {
            log::warn!("Failed to decode {}: {}", source.describe(), err);
            err
        })?;

        match self.shared.entries.entry(fingerprint) {
            Entry::Occupied(slot) if !slot.get().is_closed() => Ok((fingerprint, slot.get().clone())),
            slot => {
                let entry = ImageEntry::new(fingerprint, bitmap, &self.shared);
                slot.insert(entry.clone());
                log::debug!(
                    "Cached {:?} ({}x{}) from {}",
                    fingerprint,
                    entry.width(),
                    entry.height(),
                    source.describe()
                );
                Ok((fingerprint, entry))
            }
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<ImageEntry>> {
        self.shared
            .entries
            .get(fingerprint)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shared.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.shared.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn statistics(&self) -> StoreStatistics {
        let counters = &self.shared.counters;
        StoreStatistics {
            entries: self.shared.entries.len(),
            loaded: self
                .shared
                .entries
                .iter()
                .filter(|entry| entry.value().load_state() == LoadState::Loaded)
                .count(),
            queued: self.shared.queue.len(),
            tracked: self.shared.tracker.len(),
            loads_completed: counters.loads_completed.load(Ordering::Relaxed),
            loads_failed: counters.loads_failed.load(Ordering::Relaxed),
            loads_skipped: counters.loads_skipped.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            enqueue_displaced: counters.enqueue_displaced.load(Ordering::Relaxed),
        }
    }

    /// True while no background threads run.
    pub fn is_synchronous(&self) -> bool {
        self.background.lock().is_none()
    }

    /// Switch between background threads and host-driven pumping.
    ///
    /// Turning synchronous mode on waits for in-flight conversions to finish.
    /// Requests still queued stay queued for the pumps or the new threads.
    /// Must not be called from a notify target, which runs on those workers.
    pub fn set_synchronous(&self, synchronous: bool) -> Result<()> {
        if synchronous {
            self.stop_background();
            Ok(())
        } else {
            self.start_background()
        }
    }

    /// Convert up to `max` queued requests on the calling thread.
    ///
    /// Returns the number of textures published. Does nothing while
    /// background workers own the queue.
    pub fn drain_loads(&self, max: Option<usize>) -> usize {
        if !self.is_synchronous() {
            return 0;
        }
        let limit = max.unwrap_or(usize::MAX);
        let mut processed = 0;
        let mut loaded = 0;
        while processed < limit {
            let Some(entry) = self.shared.queue.try_pop() else {
                break;
            };
            processed += 1;
            if loader::process(&self.shared, &entry) == LoadOutcome::Loaded {
                loaded += 1;
            }
        }
        loaded
    }

    /// Run one eviction pass over at most `max` tracked entries.
    ///
    /// Passes are throttled to one per poll interval; calls in between
    /// return 0. Does nothing while the background evictor is running.
    pub fn drain_unloads(&self, max: Option<usize>) -> usize {
        if !self.is_synchronous() {
            return 0;
        }
        {
            let mut timer = self.unload_timer.lock();
            if !timer.has_elapsed(self.shared.config.poll_interval) {
                return 0;
            }
            timer.restart();
        }
        evictor::sweep(&self.shared, Instant::now(), max.unwrap_or(usize::MAX))
    }

    /// Stop background threads and unload every texture.
    ///
    /// Subscribers are told about each unload. Entries stay resolvable and
    /// the store keeps working in synchronous mode afterwards.
    pub fn shutdown(&self) {
        self.stop_background();

        for entry in self.shared.queue.drain() {
            entry.cancel_queued();
        }
        self.shared.tracker.clear();

        let entries: Vec<_> = self
            .shared
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let unloaded = entries.iter().filter(|entry| entry.unload()).count();
        if unloaded > 0 {
            log::info!("Released {} textures on shutdown", unloaded);
        }
    }

    fn start_background(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let loader = LoaderPool::spawn(&self.shared)?;
        let evictor = match Evictor::spawn(&self.shared) {
            Ok(evictor) => evictor,
            Err(err) => {
                loader.stop(&self.shared);
                return Err(err);
            }
        };
        *background = Some(Background { loader, evictor });
        Ok(())
    }

    fn stop_background(&self) {
        // Held until the workers are joined and the queue reopened, so a
        // concurrent start never spawns onto a closed queue.
        let mut slot = self.background.lock();
        let Some(background) = slot.take() else {
            return;
        };
        background.evictor.stop();
        background.loader.stop(&self.shared);
        self.unload_timer.lock().restart();
        log::debug!("Background threads stopped");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<StoreShared> {
        &self.shared
    }
}

impl Drop for ImageStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("entries", &self.len())
            .field("synchronous", &self.is_synchronous())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::image_controller::error::ImageControllerError;
    use crate::services::image_controller::testing::{
        init_logging, png_bytes, png_file, solid_bitmap, sync_config, sync_store, wait_for,
        CountingCodec, Recorder,
    };
    use crate::services::image_controller::{texture_plug, Bitmap, MemoryRenderer, PixelBuffer, TextureState};
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_resolve_dedups_and_decodes_once() {
        let codec = Arc::new(CountingCodec::new());
        let store = ImageStore::new(sync_config(), codec.clone(), Arc::new(MemoryRenderer::new())).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = png_file(&dir, "a.png", 8, 8);

        let (fp_a, a) = store.resolve(path.clone()).unwrap();
        let (fp_b, b) = store.resolve(path.as_path()).unwrap();
        let (fp_c, c) = store.resolve(path.to_string_lossy().to_string()).unwrap();

        assert_eq!(fp_a, fp_b);
        assert_eq!(fp_a, fp_c);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(codec.decodes(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_resolve_decodes_once() {
        let codec = Arc::new(CountingCodec::new());
        let store = Arc::new(
            ImageStore::new(sync_config(), codec.clone(), Arc::new(MemoryRenderer::new())).unwrap(),
        );
        let bytes = png_bytes(16, 16);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let bytes = bytes.clone();
                thread::spawn(move || store.resolve(bytes).unwrap().1)
            })
            .collect();
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(entries.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(codec.decodes(), 1);
    }

    /// Decodes byte streams only after the test lets it; everything else
    /// goes straight through.
    struct GatedCodec {
        inner: ImageCodec,
        started: Sender<()>,
        release: Receiver<()>,
    }

    impl Codec for GatedCodec {
        fn decode(&self, source: &ImageSource) -> Result<Bitmap> {
            if matches!(source, ImageSource::Bytes(_)) {
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            self.inner.decode(source)
        }

        fn to_pixel_buffer(&self, bitmap: &Bitmap) -> Result<PixelBuffer> {
            self.inner.to_pixel_buffer(bitmap)
        }
    }

    #[test]
    fn test_slow_decode_does_not_block_other_fingerprints() {
        init_logging();
        let (started_tx, started) = unbounded();
        let (release, release_rx) = unbounded();
        let codec = Arc::new(GatedCodec {
            inner: ImageCodec::new(),
            started: started_tx,
            release: release_rx,
        });
        let store = Arc::new(ImageStore::new(sync_config(), codec, Arc::new(MemoryRenderer::new())).unwrap());
        let (known, _) = store.resolve(solid_bitmap(4, 4, 0)).unwrap();

        let slow = {
            let store = store.clone();
            thread::spawn(move || store.resolve(png_bytes(8, 8)).map(|(fp, _)| fp))
        };
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done) = unbounded();
        let others = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..=255u8 {
                    store.resolve(solid_bitmap(2, 2, i)).unwrap();
                }
                assert!(store.get(&known).is_some());
                assert!(store.contains(&known));
                let _ = done_tx.send(());
            })
        };
        let finished = done.recv_timeout(Duration::from_secs(5)).is_ok();

        release.send(()).unwrap();
        let slow_fp = slow.join().unwrap().unwrap();
        others.join().unwrap();
        assert!(finished, "lookups waited for an unrelated decode");
        assert!(store.contains(&slow_fp));
    }

    #[test]
    fn test_resolve_waits_for_decode_of_same_fingerprint() {
        init_logging();
        let (started_tx, started) = unbounded();
        let (release, release_rx) = unbounded();
        let codec = Arc::new(GatedCodec {
            inner: ImageCodec::new(),
            started: started_tx,
            release: release_rx,
        });
        let store = Arc::new(ImageStore::new(sync_config(), codec, Arc::new(MemoryRenderer::new())).unwrap());
        let bytes = png_bytes(8, 8);

        let first = {
            let store = store.clone();
            let bytes = bytes.clone();
            thread::spawn(move || store.resolve(bytes).unwrap().1)
        };
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = {
            let store = store.clone();
            thread::spawn(move || store.resolve(bytes).unwrap().1)
        };

        // The second resolve must not start a decode of its own.
        assert!(started.recv_timeout(Duration::from_millis(100)).is_err());
        release.send(()).unwrap();

        let (a, b) = (first.join().unwrap(), second.join().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(started.try_recv().is_err());
        assert!(store.shared().decoding.is_empty());
    }

    #[test]
    fn test_distinct_sources_get_distinct_entries() {
        let (store, _renderer, dir) = sync_store();
        let (a, _) = store.resolve(png_file(&dir, "a.png", 4, 4)).unwrap();
        let (b, _) = store.resolve(png_file(&dir, "b.png", 4, 4)).unwrap();
        let (c, _) = store.resolve(solid_bitmap(4, 4, 9)).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        let mut all = store.fingerprints();
        all.sort();
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_bad_sources_are_not_inserted() {
        let (store, _renderer, dir) = sync_store();

        let err = store.resolve(b"not an image".to_vec()).unwrap_err();
        assert!(matches!(err, ImageControllerError::Decode(_)));
        let err = store.resolve(dir.path()).unwrap_err();
        assert!(matches!(err, ImageControllerError::InvalidSource(_)));
        let err = store.resolve(Vec::new()).unwrap_err();
        assert!(err.is_source_error());

        assert!(store.is_empty());
    }

    #[test]
    fn test_resolve_after_close_creates_fresh_entry() {
        let (store, _renderer, dir) = sync_store();
        let path = png_file(&dir, "a.png", 4, 4);
        let (fingerprint, first) = store.resolve(path.clone()).unwrap();
        let handle = first.subscribe(Recorder::new().target()).unwrap();
        first.unsubscribe(handle);
        assert!(store.get(&fingerprint).is_none());

        let (again, second) = store.resolve(path).unwrap();
        assert_eq!(again, fingerprint);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());

        // The old entry must not remove its successor.
        assert!(!store.shared().remove(&fingerprint, &first));
        assert!(store.contains(&fingerprint));
    }

    #[test]
    fn test_lifo_priority_with_drop_on_full() {
        init_logging();
        let codec = Arc::new(CountingCodec::new());
        let renderer = Arc::new(MemoryRenderer::new());
        let config = sync_config().with_queue_capacity(2);
        let store = ImageStore::new(config, codec, renderer.clone()).unwrap();

        let entries: Vec<_> = (0..5u8)
            .map(|i| store.resolve(solid_bitmap(4, 4, i)).unwrap().1)
            .collect();
        for entry in &entries {
            entry.mark_visible();
        }

        let stats = store.statistics();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.enqueue_displaced, 3);

        assert_eq!(store.drain_loads(None), 2);
        let states: Vec<_> = entries.iter().map(|e| e.load_state()).collect();
        assert_eq!(
            states,
            vec![
                LoadState::Unloaded,
                LoadState::Unloaded,
                LoadState::Unloaded,
                LoadState::Loaded,
                LoadState::Loaded,
            ]
        );
        assert_eq!(renderer.upload_count(), 2);

        // Re-requesting brings a dropped one back.
        entries[0].mark_visible();
        assert_eq!(store.drain_loads(None), 1);
        assert_eq!(entries[0].load_state(), LoadState::Loaded);
    }

    #[test]
    fn test_drain_loads_respects_max() {
        let (store, _renderer, _dir) = sync_store();
        let entries: Vec<_> = (0..2u8)
            .map(|i| store.resolve(solid_bitmap(2, 2, i)).unwrap().1)
            .collect();
        entries.iter().for_each(|e| e.mark_visible());

        assert_eq!(store.drain_loads(Some(1)), 1);
        assert_eq!(entries[1].load_state(), LoadState::Loaded);
        assert_eq!(entries[0].load_state(), LoadState::Queued);
        assert_eq!(store.drain_loads(Some(1)), 1);
        assert_eq!(store.drain_loads(Some(1)), 0);
    }

    #[test]
    fn test_at_most_one_conversion_under_concurrent_visibility() {
        let codec = Arc::new(CountingCodec::new());
        let renderer = Arc::new(MemoryRenderer::new());
        let config = ControllerConfig::new()
            .with_worker_count(2)
            .with_inactivity_timeout(Duration::from_secs(30));
        let store = Arc::new(ImageStore::new(config, codec.clone(), renderer.clone()).unwrap());
        let (_, entry) = store.resolve(png_bytes(32, 32)).unwrap();
        let recorder = Recorder::new();
        entry.subscribe(recorder.target()).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let entry = entry.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        entry.mark_visible();
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().unwrap());

        let first = recorder.next_event(Duration::from_secs(5)).unwrap();
        assert!(first.is_loaded);
        // Late visibility ticks after the load must not convert again.
        for _ in 0..50 {
            entry.mark_visible();
        }
        thread::sleep(Duration::from_millis(100));

        assert_eq!(codec.conversions(), 1);
        assert_eq!(renderer.upload_count(), 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_background_eviction_and_reload() {
        init_logging();
        let renderer = Arc::new(MemoryRenderer::new());
        let config = ControllerConfig::new()
            .with_worker_count(1)
            .with_queue_capacity(1)
            .with_inactivity_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(100));
        let store = ImageStore::new(config, Arc::new(ImageCodec::new()), renderer.clone()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (fingerprint, entry) = store.resolve(png_file(&dir, "a.png", 200, 100)).unwrap();
        assert_eq!((entry.width(), entry.height()), (200, 100));

        let recorder = Recorder::new();
        let handle = entry.subscribe(recorder.target()).unwrap();
        entry.mark_visible();

        let loaded = recorder.next_event(Duration::from_secs(5)).unwrap();
        assert!(loaded.is_loaded);
        assert_ne!(loaded.handle, texture_plug());

        // No more visibility: the evictor takes it back.
        let unloaded = recorder.next_event(Duration::from_secs(5)).unwrap();
        assert_eq!(unloaded, TextureState::unloaded());
        assert!(!renderer.is_live(loaded.handle));
        assert_eq!(entry.render_handle(), texture_plug());

        entry.mark_visible();
        let reloaded = recorder.next_event(Duration::from_secs(5)).unwrap();
        assert!(reloaded.is_loaded);
        assert_ne!(reloaded.handle, loaded.handle);
        assert!(store.statistics().evictions >= 1);

        entry.unsubscribe(handle);
        assert!(!store.contains(&fingerprint));
        assert!(wait_for(Duration::from_secs(5), || renderer.live_textures() == 0));
    }

    #[test]
    fn test_drain_unloads_is_throttled() {
        let renderer = Arc::new(MemoryRenderer::new());
        let config = sync_config()
            .with_inactivity_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(50));
        let store = ImageStore::new(config, Arc::new(ImageCodec::new()), renderer.clone()).unwrap();
        let (_, entry) = store.resolve(solid_bitmap(4, 4, 1)).unwrap();
        entry.mark_visible();
        store.drain_loads(None);
        assert_eq!(renderer.live_textures(), 1);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(store.drain_unloads(None), 1);
        assert_eq!(entry.load_state(), LoadState::Unloaded);

        entry.mark_visible();
        store.drain_loads(None);
        thread::sleep(Duration::from_millis(30));
        // Idle again, but the last pass was too recent.
        assert_eq!(store.drain_unloads(None), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(store.drain_unloads(None), 1);
    }

    #[test]
    fn test_pumps_are_noops_with_background_threads() {
        let store = ImageStore::with_defaults(Arc::new(MemoryRenderer::new())).unwrap();
        assert!(!store.is_synchronous());
        assert_eq!(store.drain_loads(None), 0);
        assert_eq!(store.drain_unloads(None), 0);
    }

    #[test]
    fn test_toggle_synchronous_mode() {
        let renderer = Arc::new(MemoryRenderer::new());
        let store = ImageStore::new(sync_config(), Arc::new(ImageCodec::new()), renderer.clone()).unwrap();
        assert!(store.is_synchronous());
        let (_, entry) = store.resolve(solid_bitmap(4, 4, 3)).unwrap();
        let recorder = Recorder::new();
        entry.subscribe(recorder.target()).unwrap();
        entry.mark_visible();

        // Queued work is picked up by the workers once they start.
        store.set_synchronous(false).unwrap();
        assert!(!store.is_synchronous());
        assert!(recorder.next_event(Duration::from_secs(5)).unwrap().is_loaded);

        store.set_synchronous(true).unwrap();
        assert!(store.is_synchronous());
        assert_eq!(entry.load_state(), LoadState::Loaded);
    }

    #[test]
    fn test_racing_mode_toggles_leave_working_workers() {
        init_logging();
        let renderer = Arc::new(MemoryRenderer::new());
        let store = Arc::new(ImageStore::new(sync_config(), Arc::new(ImageCodec::new()), renderer).unwrap());

        let togglers: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        store.set_synchronous(round % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        togglers.into_iter().for_each(|t| t.join().unwrap());

        store.set_synchronous(false).unwrap();
        let (_, entry) = store.resolve(solid_bitmap(4, 4, 1)).unwrap();
        let recorder = Recorder::new();
        entry.subscribe(recorder.target()).unwrap();
        entry.mark_visible();

        let event = recorder.next_event(Duration::from_secs(5)).unwrap();
        assert!(event.is_loaded);
        assert!(!store.shared().queue.is_closed());
        store.set_synchronous(true).unwrap();
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let renderer = Arc::new(MemoryRenderer::new());
        let config = ControllerConfig::new().with_worker_count(3);
        let store = ImageStore::new(config, Arc::new(ImageCodec::new()), renderer.clone()).unwrap();
        let recorders: Vec<_> = (0..4u8)
            .map(|i| {
                let (_, entry) = store.resolve(solid_bitmap(8, 8, i)).unwrap();
                let recorder = Recorder::new();
                entry.subscribe(recorder.target()).unwrap();
                entry.mark_visible();
                (entry, recorder)
            })
            .collect();
        for (_, recorder) in &recorders {
            assert!(recorder.next_event(Duration::from_secs(5)).unwrap().is_loaded);
        }
        assert_eq!(renderer.live_textures(), 4);

        store.shutdown();

        assert!(store.is_synchronous());
        assert_eq!(renderer.live_textures(), 0);
        for (entry, recorder) in &recorders {
            assert_eq!(entry.load_state(), LoadState::Unloaded);
            assert_eq!(recorder.events().last(), Some(&TextureState::unloaded()));
        }
        assert_eq!(store.statistics().tracked, 0);
    }

    #[test]
    fn test_drop_joins_background_threads() {
        let renderer = Arc::new(MemoryRenderer::new());
        {
            let store = ImageStore::new(
                ControllerConfig::new().with_worker_count(4),
                Arc::new(ImageCodec::new()),
                renderer.clone(),
            )
            .unwrap();
            let (_, entry) = store.resolve(solid_bitmap(4, 4, 5)).unwrap();
            entry.subscribe(Recorder::new().target()).unwrap();
            entry.mark_visible();
        }
        assert_eq!(renderer.live_textures(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = ImageStore::new(
            ControllerConfig::new().with_worker_count(0),
            Arc::new(ImageCodec::new()),
            Arc::new(MemoryRenderer::new()),
        );
        assert!(matches!(result, Err(ImageControllerError::InvalidConfig(_))));
    }
}
