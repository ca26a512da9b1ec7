//! Bounded last-in-first-out queue of load requests.
//!
//! The most recently requested image is always serviced first. Pushing onto
//! a full queue never blocks: the oldest request at the bottom is pushed out
//! instead, since an image requested long ago has most likely scrolled away.

use std::collections::VecDeque;

use crate::prelude::*;

/// Result of a [`LoadQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Queued with room to spare
    Accepted,
    /// Queued, and the returned stale request was dropped to make room
    Displaced(T),
}

struct QueueState<T> {
    // Front is the oldest request, back the newest.
    items: VecDeque<T>,
    closed: bool,
}

pub struct LoadQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> LoadQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Push a request on top of the stack without ever waiting.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut state = self.state.lock();
        let displaced = if state.items.len() >= self.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);

        self.available.notify_one();
        match displaced {
            Some(old) => PushOutcome::Displaced(old),
            None => PushOutcome::Accepted,
        }
    }

    /// Take the newest request, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the queue is closed. Requests still
    /// queued at close time stay in the queue for a later pump or restart.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_back() {
                return Some(item);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return if state.closed {
                    None
                } else {
                    state.items.pop_back()
                };
            }
        }
    }

    /// Take the newest request if there is one.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_back()
    }

    /// Remove every queued request, newest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.items.drain(..).rev().collect()
    }

    /// Wake every waiting worker and make them return `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
