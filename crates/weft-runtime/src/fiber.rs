//! The fiber primitive
//!
//! A fiber is a suspendable execution context with its own stack. It is
//! created READY, runs when a worker (or an explicit `resume`) switches
//! into it, parks itself at suspension points, and terminates when its
//! entry returns or unwinds.
//!
//! The park word resolves the suspend/wake race: the worker finishes the
//! park only after the context switch has saved the fiber's registers,
//! and a wake that arrives in between is latched as NOTIFIED so the
//! worker requeues the fiber immediately instead of losing the wake.

use crate::arch::{self, SavedContext};
use crate::stack::Stack;
use crate::{scheduler, tls};
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use weft_core::{FiberId, FiberState, SpinLock, WeftError, WeftResult};

/// Park word values
pub(crate) const PARK_IDLE: u8 = 0;
pub(crate) const PARK_PARKED: u8 = 1;
pub(crate) const PARK_NOTIFIED: u8 = 2;

/// How a terminated fiber's entry ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Still running (entry has not finished)
    Unfinished,
    /// Entry returned normally
    Normal,
    /// Entry unwound; the payload message is kept
    Panicked(String),
}

/// A cooperatively-scheduled execution context with its own stack
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    park: AtomicU8,
    ctx: UnsafeCell<SavedContext>,
    stack: Stack,
    entry: SpinLock<Option<Box<dyn FnOnce() + Send + 'static>>>,
    exit: SpinLock<ExitDisposition>,
}

// Safety: the state machine guarantees a fiber is mutated by at most one
// thread at a time (exactly one worker owns a RUNNING fiber; SUSPENDED
// and READY fibers are only moved between queues).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size
    ///
    /// The fiber is READY but not queued; `scheduler::spawn` both
    /// creates and queues.
    pub fn new<F>(entry: F) -> WeftResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(entry, crate::stack::DEFAULT_STACK_SIZE)
    }

    /// Create a fiber with an explicit stack size
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> WeftResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            park: AtomicU8::new(PARK_IDLE),
            ctx: UnsafeCell::new(SavedContext::new()),
            stack,
            entry: SpinLock::new(Some(Box::new(entry))),
            exit: SpinLock::new(ExitDisposition::Unfinished),
        });

        // The entry trampoline receives the raw fiber pointer; the Arc
        // held by whoever runs the fiber keeps it alive for the call.
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.top(),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        Ok(fiber)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn park_word(&self) -> &AtomicU8 {
        &self.park
    }

    #[inline]
    pub(crate) fn ctx_ptr(&self) -> *mut SavedContext {
        self.ctx.get()
    }

    /// How the entry ended, once the fiber is TERMINATED
    pub fn exit_disposition(&self) -> ExitDisposition {
        self.exit.lock().clone()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry point running on the fiber's own stack
///
/// Never returns: ends by switching back to the thread's scheduler
/// context with state TERMINATED.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = fiber.entry.lock().take();
    if let Some(f) = entry {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => {
                *fiber.exit.lock() = ExitDisposition::Normal;
            }
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                log::error!("fiber {} panicked: {}", fiber.id, msg);
                *fiber.exit.lock() = ExitDisposition::Panicked(msg);
            }
        }
    }

    fiber.set_state(FiberState::Terminated);

    // Back to whoever resumed us; the fiber's own context is dead now.
    unsafe {
        arch::switch(fiber.ctx_ptr(), tls::sched_ctx());
    }
    unreachable!("terminated fiber resumed");
}

/// Explicitly resume a fiber on the calling thread
///
/// This is the deterministic driving mode used by tests: the caller's
/// context becomes the switch-back target, so a `yield_now` inside the
/// fiber returns control here. A yielded fiber is NOT requeued; the
/// caller decides when (and whether) to resume it again.
pub fn resume(fiber: &Arc<Fiber>) -> WeftResult<()> {
    if tls::is_in_fiber() {
        // The switch-back target is this thread's scheduler context;
        // entering it from a fiber would overwrite the state the current
        // fiber needs to get back to its own worker
        return Err(WeftError::Invariant("resume from inside a fiber"));
    }
    match fiber.state() {
        FiberState::Ready | FiberState::Suspended => {}
        FiberState::Terminated => {
            return Err(WeftError::Invariant("cannot resume a terminated fiber"))
        }
        FiberState::Running => {
            return Err(WeftError::Invariant("fiber is already running"))
        }
    }

    scheduler::execute(fiber);
    if fiber.state() == FiberState::Suspended {
        scheduler::complete_park(fiber);
    }
    Ok(())
}
