//! Shared types used across services.

use std::time::{Duration, Instant};

/// Timer utility for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// True once at least `interval` has passed since the timer started.
    pub fn has_elapsed(&self, interval: Duration) -> bool {
        self.start.elapsed() >= interval
    }

    pub fn restart(&mut self) {
        self.start = Instant::now();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}
