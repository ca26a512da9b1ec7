//! Loader pool: worker threads turning queued bitmaps into textures.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::prelude::*;

use super::entry::{panic_message, ImageEntry};
use super::error::{ImageControllerError, Result};
use super::renderer::RenderHandle;
use super::store::StoreShared;
use super::types::Bitmap;

/// What happened to one dequeued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadOutcome {
    /// Texture uploaded and published
    Loaded,
    /// Conversion or upload failed, entry is back to the plug
    Failed,
    /// Request went stale while queued, or nobody wanted the result
    Skipped,
}

/// Fixed set of loader workers sharing the store's queue.
pub(crate) struct LoaderPool {
    workers: Vec<JoinHandle<()>>,
}

impl LoaderPool {
    pub(crate) fn spawn(shared: &Arc<StoreShared>) -> Result<Self> {
        let count = shared.config.worker_count;
        let mut pool = Self {
            workers: Vec::with_capacity(count),
        };

        for id in 0..count {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("image-loader-{}", id))
                .spawn(move || run_worker(id, &worker_shared));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    log::error!("Failed to spawn loader worker {}: {}", id, err);
                    pool.stop(shared);
                    return Err(ImageControllerError::Io(err));
                }
            }
        }

        log::debug!("Started {} loader workers", count);
        Ok(pool)
    }

    /// Close the queue, wait for running conversions, then reopen the queue
    /// so anything still pending survives for the next consumer.
    pub(crate) fn stop(self, shared: &StoreShared) {
        shared.queue.close();
        for (id, worker) in self.workers.into_iter().enumerate() {
            if worker.join().is_err() {
                log::error!("Loader worker {} panicked", id);
            }
        }
        shared.queue.reopen();
    }
}

fn run_worker(id: usize, shared: &StoreShared) {
    log::trace!("Loader worker {} running", id);
    loop {
        match shared.queue.pop_blocking(shared.config.poll_interval) {
            Some(entry) => {
                process(shared, &entry);
            }
            None if shared.queue.is_closed() => break,
            None => {}
        }
    }
    log::trace!("Loader worker {} exiting", id);
}

/// Handle one dequeued request: re-check it, convert, upload, publish.
///
/// Never fails; errors are logged and leave the entry on the plug until the
/// next visibility tick asks again.
pub(crate) fn process(shared: &StoreShared, entry: &Arc<ImageEntry>) -> LoadOutcome {
    let outcome = load_entry(shared, entry);
    shared.counters.record(outcome);
    outcome
}

fn load_entry(shared: &StoreShared, entry: &Arc<ImageEntry>) -> LoadOutcome {
    let Some(bitmap) = entry.begin_loading(Instant::now()) else {
        log::trace!("Skipping stale load request for {:?}", entry.fingerprint());
        return LoadOutcome::Skipped;
    };

    let timer = Timer::start();
    let converted = panic::catch_unwind(AssertUnwindSafe(|| convert(shared, &bitmap)))
        .unwrap_or_else(|payload| {
            Err(ImageControllerError::Conversion {
                fingerprint: String::new(),
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            })
        });
    drop(bitmap);

    match converted {
        Ok(handle) => {
            log::debug!(
                "Loaded {:?} as {:?} in {:.1}ms",
                entry.fingerprint(),
                handle,
                timer.elapsed_ms()
            );
            if entry.publish_loaded(handle) {
                LoadOutcome::Loaded
            } else {
                LoadOutcome::Skipped
            }
        }
        Err(err) => {
            let err = with_fingerprint(err, entry);
            log::warn!("{}", err);
            entry.abort_loading();
            LoadOutcome::Failed
        }
    }
}

fn convert(shared: &StoreShared, bitmap: &Bitmap) -> Result<RenderHandle> {
    let pixels = shared.codec.to_pixel_buffer(bitmap)?;
    shared.renderer.upload(pixels.width, pixels.height, &pixels)
}

/// Every background failure is reported as a conversion error of the entry.
fn with_fingerprint(err: ImageControllerError, entry: &ImageEntry) -> ImageControllerError {
    let fingerprint = entry.fingerprint().to_string();
    match err {
        ImageControllerError::Conversion { reason, .. } => {
            ImageControllerError::Conversion { fingerprint, reason }
        }
        other => ImageControllerError::Conversion {
            fingerprint,
            reason: other.to_string(),
        },
    }
}
