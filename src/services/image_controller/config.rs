//! Configuration for the image controller

use std::time::Duration;

use crate::prelude::*;

use super::error::{ImageControllerError, Result};

pub const ENV_INACTIVITY_TIMEOUT: &str = "IMAGE_CONTROLLER_INACTIVITY_TIMEOUT";
pub const ENV_POLL_INTERVAL: &str = "IMAGE_CONTROLLER_POLL_INTERVAL";
pub const ENV_WORKERS: &str = "IMAGE_CONTROLLER_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "IMAGE_CONTROLLER_QUEUE_CAPACITY";
pub const ENV_SYNCHRONOUS: &str = "IMAGE_CONTROLLER_SYNCHRONOUS";

/// Configuration for an [`ImageStore`](super::ImageStore).
///
/// Tunables are fixed when the store is built. Loader workers and the
/// evictor read them, nothing writes them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Time after the last visibility tick before a texture is unloaded
    pub inactivity_timeout: Duration,
    /// Cadence of the eviction sweep
    pub poll_interval: Duration,
    /// Number of loader workers
    pub worker_count: usize,
    /// Bound of the LIFO load queue; `None` means twice the worker count
    pub queue_capacity: Option<usize>,
    /// Run without background threads; the host pumps
    /// `drain_loads`/`drain_unloads` from its frame loop instead
    pub synchronous_mode: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            worker_count: 2,
            queue_capacity: None,
            synchronous_mode: false,
        }
    }
}

impl ControllerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter timeouts for galleries that scroll a lot.
    pub fn responsive() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(4),
            poll_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Defaults overlaid with any `IMAGE_CONTROLLER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `IMAGE_CONTROLLER_*` environment variables on top of `self`.
    /// Values that do not parse are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = read_env(ENV_INACTIVITY_TIMEOUT, parse_seconds) {
            self.inactivity_timeout = secs;
        }
        if let Some(secs) = read_env(ENV_POLL_INTERVAL, parse_seconds) {
            self.poll_interval = secs;
        }
        if let Some(workers) = read_env(ENV_WORKERS, |v| v.parse::<usize>().ok()) {
            self.worker_count = workers;
        }
        if let Some(capacity) = read_env(ENV_QUEUE_CAPACITY, |v| v.parse::<usize>().ok()) {
            self.queue_capacity = Some(capacity);
        }
        if let Some(sync) = read_env(ENV_SYNCHRONOUS, parse_bool) {
            self.synchronous_mode = sync;
        }
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Disable background threads
    pub fn synchronous(mut self) -> Self {
        self.synchronous_mode = true;
        self
    }

    /// Effective queue bound
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.worker_count.saturating_mul(2))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(ImageControllerError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.effective_queue_capacity() == 0 {
            return Err(ImageControllerError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ImageControllerError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_env<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        log::warn!("Ignoring unparseable {}={:?}", key, raw);
    }
    parsed
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
