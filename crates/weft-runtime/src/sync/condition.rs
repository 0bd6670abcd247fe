//! Fiber-aware condition variable
//!
//! Always used with a `FiberMutex`. The wait enqueues the caller before
//! releasing the lock, so a notify issued by the next lock holder cannot
//! slip between unlock and park.

use crate::sync::mutex::{FiberMutex, FiberMutexGuard};
use crate::wait_queue::{WaitQueue, WAIT_TIMED_OUT};
use crate::{runtime, scheduler};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Condition variable for fibers
pub struct FiberCondition {
    waiters: Arc<WaitQueue>,
}

impl Default for FiberCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberCondition {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(WaitQueue::new()),
        }
    }

    /// Release the lock, park until notified, reacquire, return the lock
    ///
    /// Spurious predicate invalidation is possible between notify and
    /// resume; callers re-check their predicate.
    pub fn wait<'a, T>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let mutex: &'a FiberMutex<T> = guard.mutex();
        self.waiters.wait_with(move || drop(guard));
        mutex.lock()
    }

    /// Like `wait`, bounded by a timeout in milliseconds
    ///
    /// Returns the reacquired guard and whether the wait timed out. A
    /// notify that races the timeout and loses is swallowed, so notify
    /// counts match wakes.
    pub fn wait_for<'a, T>(
        &self,
        guard: FiberMutexGuard<'a, T>,
        timeout_ms: u64,
    ) -> (FiberMutexGuard<'a, T>, bool) {
        let mutex: &'a FiberMutex<T> = guard.mutex();

        let node = self.waiters.enqueue_current();
        let queue = self.waiters.clone();
        let token = node.token;
        let timer = runtime::runtime().wheel().add(
            timeout_ms as i64,
            move || {
                if let Some(removed) = queue.remove(token) {
                    removed.outcome.store(WAIT_TIMED_OUT, Ordering::Release);
                    scheduler::ready(removed.fiber.clone());
                }
            },
            false,
        );

        let timer = match timer {
            Ok(handle) => handle,
            Err(_) => {
                // Wheel is gone (shutdown); give the wait up rather than
                // park with no timeout armed
                if self.waiters.remove(token).is_some() {
                    return (guard, true);
                }
                drop(guard);
                scheduler::park_current();
                return (mutex.lock(), false);
            }
        };

        drop(guard);
        scheduler::park_current();

        runtime::runtime().wheel().cancel(&timer);

        let timed_out = node.outcome() == WAIT_TIMED_OUT;
        (mutex.lock(), timed_out)
    }

    /// Wait until `predicate` stops holding
    pub fn wait_while<'a, T, P>(
        &self,
        mut guard: FiberMutexGuard<'a, T>,
        mut predicate: P,
    ) -> FiberMutexGuard<'a, T>
    where
        P: FnMut(&T) -> bool,
    {
        while predicate(&*guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wake one waiting fiber
    pub fn notify_one(&self) -> bool {
        self.waiters.notify_one()
    }

    /// Wake every waiting fiber
    pub fn notify_all(&self) -> usize {
        self.waiters.notify_all()
    }
}
