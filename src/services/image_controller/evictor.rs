//! Evictor: periodic sweep releasing textures nobody looks at.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::prelude::*;

use super::entry::{ImageEntry, SweepOutcome};
use super::error::{ImageControllerError, Result};
use super::store::StoreShared;

/// Loaded entries together with the generation they were loaded under.
///
/// An entry joins when it publishes a texture and leaves once it is evicted
/// or its record goes stale.
#[derive(Default)]
pub(crate) struct IdleTracker {
    tracked: Mutex<Vec<(Arc<ImageEntry>, u64)>>,
}

impl IdleTracker {
    /// Watch `entry` under `token`. An entry has at most one record; tracking
    /// it again only moves the record to the newer generation.
    pub(crate) fn track(&self, entry: Arc<ImageEntry>, token: u64) {
        let mut tracked = self.tracked.lock();
        match tracked.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &entry)) {
            Some(record) => record.1 = token,
            None => tracked.push((entry, token)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tracked.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.tracked.lock().clear();
    }

    fn take(&self) -> Vec<(Arc<ImageEntry>, u64)> {
        std::mem::take(&mut *self.tracked.lock())
    }

    fn restore(&self, kept: Vec<(Arc<ImageEntry>, u64)>) {
        if kept.is_empty() {
            return;
        }
        // An entry reloaded while the sweep ran already has a newer record.
        let mut tracked = self.tracked.lock();
        let fresh = tracked.len();
        for (entry, token) in kept {
            if !tracked[..fresh].iter().any(|(known, _)| Arc::ptr_eq(known, &entry)) {
                tracked.push((entry, token));
            }
        }
    }
}

/// One pass over the tracked entries, evicting at most `max` of them.
///
/// Entries are checked without holding the tracker lock, so loads finishing
/// during the pass are never blocked by it.
pub(crate) fn sweep(shared: &StoreShared, now: Instant, max: usize) -> usize {
    let records = shared.tracker.take();
    if records.is_empty() {
        return 0;
    }

    let mut kept = Vec::with_capacity(records.len());
    let mut evicted = 0;
    let mut stale = 0;
    for (entry, token) in records {
        if evicted >= max {
            kept.push((entry, token));
            continue;
        }
        match entry.unload_if_idle(token, now) {
            SweepOutcome::Evicted => evicted += 1,
            SweepOutcome::Keep => kept.push((entry, token)),
            SweepOutcome::Stale => stale += 1,
        }
    }
    shared.tracker.restore(kept);

    if evicted > 0 {
        shared.counters.record_evictions(evicted);
        log::debug!("Evicted {} idle textures ({} stale records dropped)", evicted, stale);
    }
    evicted
}

/// Background sweep thread, woken every poll interval.
pub(crate) struct Evictor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Evictor {
    pub(crate) fn spawn(shared: &Arc<StoreShared>) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let shared = shared.clone();
        let interval = shared.config.poll_interval;

        let handle = thread::Builder::new()
            .name("image-evictor".to_string())
            .spawn(move || {
                log::trace!("Evictor running every {:?}", interval);
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep(&shared, Instant::now(), usize::MAX);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::trace!("Evictor exiting");
            })
            .map_err(ImageControllerError::Io)?;

        Ok(Self { stop, handle })
    }

    pub(crate) fn stop(self) {
        // A full or disconnected channel means the thread is already leaving.
        let _ = self.stop.try_send(());
        if self.handle.join().is_err() {
            log::error!("Evictor thread panicked");
        }
    }
}
