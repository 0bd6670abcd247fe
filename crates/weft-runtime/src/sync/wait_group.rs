//! Go-style wait group
//!
//! Counts outstanding work; `wait` parks until the counter reaches zero.

use crate::wait_queue::WaitQueue;
use crate::tls;
use std::sync::atomic::{AtomicI64, Ordering};
use weft_core::{WeftError, WeftResult};

/// Counter of outstanding tasks with parking waiters
pub struct WaitGroup {
    counter: AtomicI64,
    waiters: WaitQueue,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(0),
            waiters: WaitQueue::new(),
        }
    }

    /// Adjust the counter by `delta` (negative to complete work)
    ///
    /// Dropping the counter below zero is a misuse; the add is rolled
    /// back and `Invariant` returned.
    pub fn add(&self, delta: i64) -> WeftResult<()> {
        let old = self.counter.fetch_add(delta, Ordering::AcqRel);
        let new = old + delta;
        if new < 0 {
            self.counter.fetch_sub(delta, Ordering::AcqRel);
            return Err(WeftError::Invariant("wait group counter went negative"));
        }
        if new == 0 {
            self.waiters.notify_all();
        }
        Ok(())
    }

    /// Complete one task
    pub fn done(&self) -> WeftResult<()> {
        self.add(-1)
    }

    /// Park until the counter reaches zero
    ///
    /// Outside a fiber this degrades to a yielding spin.
    pub fn wait(&self) {
        if !tls::is_in_fiber() {
            while self.counter.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
            }
            return;
        }

        while self.counter.load(Ordering::Acquire) > 0 {
            // Re-check inside the queue so a done() landing between the
            // check and the enqueue cannot strand us
            self.waiters
                .wait_unless(|| self.counter.load(Ordering::Acquire) == 0);
        }
    }

    /// Current counter value
    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
}
