//! Thread-local storage for the running fiber and the worker context
//!
//! Every OS thread that resumes fibers (workers, or a test thread using
//! explicit `resume`) keeps its own scheduler context here: the register
//! state a fiber switches back into when it yields or parks.

use crate::arch::SavedContext;
use crate::fiber::Fiber;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Arc;

thread_local! {
    /// Fiber currently running on this thread, if any
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Register save area for this thread's scheduler loop
    static SCHED_CTX: UnsafeCell<SavedContext> = const { UnsafeCell::new(SavedContext::new()) };

    /// Worker index, or usize::MAX when this thread is not a worker
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Install the given fiber as current for this thread
pub(crate) fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Clear the current fiber (worker going back to its loop)
pub(crate) fn clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// The fiber currently running on this thread
#[inline]
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Check if we're running inside a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// This thread's scheduler context save area
///
/// The address is stable for the lifetime of the thread.
#[inline]
pub(crate) fn sched_ctx() -> *mut SavedContext {
    SCHED_CTX.with(|c| c.get())
}

/// Mark this thread as worker `id`
pub(crate) fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
}

/// Worker index of this thread, if it is a worker
#[inline]
pub(crate) fn worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|c| c.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}
