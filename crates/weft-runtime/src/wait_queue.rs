//! FIFO queue of suspended fibers
//!
//! The base of every blocking primitive: mutex, condition, wait group,
//! channel, and the per-fd waiter slots. A locked `VecDeque` keeps FIFO
//! fairness and allows a timed-out waiter to be pulled out of the middle
//! by its token, which a lock-free list cannot do cheaply.
//!
//! No spurious wakes are produced; callers must still re-check their
//! predicate because it may be invalidated between notify and resume.

use crate::fiber::Fiber;
use crate::scheduler;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use weft_core::SpinLock;

/// Why a waiter was released
pub(crate) const WAIT_PENDING: u8 = 0;
pub(crate) const WAIT_NOTIFIED: u8 = 1;
pub(crate) const WAIT_TIMED_OUT: u8 = 2;

/// One suspended fiber in a queue
pub(crate) struct WaitNode {
    pub(crate) fiber: Arc<Fiber>,
    pub(crate) token: u64,
    pub(crate) outcome: AtomicU8,
}

impl WaitNode {
    pub(crate) fn outcome(&self) -> u8 {
        self.outcome.load(Ordering::Acquire)
    }
}

/// An ordered sequence of suspended fibers with FIFO admission
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<WaitNode>>>,
    next_token: AtomicU64,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Enqueue the current fiber without parking it yet
    pub(crate) fn enqueue_current(&self) -> Arc<WaitNode> {
        let fiber = crate::tls::current().expect("wait on a queue outside a fiber");
        let node = Arc::new(WaitNode {
            fiber,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            outcome: AtomicU8::new(WAIT_PENDING),
        });
        self.waiters.lock().push_back(node.clone());
        node
    }

    /// Suspend the current fiber until notified
    pub fn wait(&self) {
        self.enqueue_current();
        scheduler::park_current();
    }

    /// Suspend the current fiber, running `before_park` between the
    /// enqueue and the park
    ///
    /// Used by the condition variable to release its mutex atomically
    /// with respect to notifiers: a notify that lands after the closure
    /// already sees this fiber in the queue.
    pub(crate) fn wait_with<F: FnOnce()>(&self, before_park: F) -> Arc<WaitNode> {
        let node = self.enqueue_current();
        before_park();
        scheduler::park_current();
        node
    }

    /// Enqueue, then skip the park entirely if `ready` turns true
    ///
    /// Closes the check-then-block race in lock acquisition: without the
    /// re-check, an unlock between the failed fast path and the enqueue
    /// would leave the caller parked with nobody left to notify it.
    ///
    /// Returns whether `ready` observed success; on false the caller was
    /// parked, has been woken, and must re-run its acquisition attempt.
    pub(crate) fn wait_unless<F: FnMut() -> bool>(&self, mut ready: F) -> bool {
        let node = self.enqueue_current();
        if ready() {
            if self.remove(node.token).is_some() {
                return true;
            }
            // Someone already popped us and is about to (or did) wake
            // us; consume that wake so it cannot fire later.
            scheduler::park_current();
            return true;
        }
        scheduler::park_current();
        false
    }

    /// Wake the fiber at the head of the queue
    ///
    /// Returns whether a fiber was woken.
    pub fn notify_one(&self) -> bool {
        let node = self.waiters.lock().pop_front();
        match node {
            Some(node) => {
                node.outcome.store(WAIT_NOTIFIED, Ordering::Release);
                scheduler::ready(node.fiber.clone());
                true
            }
            None => false,
        }
    }

    /// Wake every queued fiber; returns how many
    pub fn notify_all(&self) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        let count = drained.len();
        for node in drained {
            node.outcome.store(WAIT_NOTIFIED, Ordering::Release);
            scheduler::ready(node.fiber.clone());
        }
        count
    }

    /// Pull a waiter out of the middle of the queue by token
    ///
    /// Used by timers to retract a timed-out wait. The caller wakes the
    /// fiber itself after stamping the outcome.
    pub(crate) fn remove(&self, token: u64) -> Option<Arc<WaitNode>> {
        let mut waiters = self.waiters.lock();
        let pos = waiters.iter().position(|n| n.token == token)?;
        waiters.remove(pos)
    }

    /// Number of queued fibers (racy; for diagnostics and tests)
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}
