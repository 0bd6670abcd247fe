//! Multi-threaded cooperative scheduler
//!
//! N worker threads each own a local FIFO run queue; a shared injector
//! queue takes overflow and wakes arriving from outside fiber context
//! (the driver thread, timer callbacks, cross-thread notifies). A worker
//! loop pops local first, then the injector, then steals from a peer.
//!
//! Requeue discipline: a fiber that yields or parks sets its state and
//! switches out; the WORKER decides what to do with it after the switch
//! has returned, i.e. after the fiber's registers are safely saved.
//! Without this, another worker could resume the fiber while it is still
//! running on this one.

use crate::arch;
use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, PARK_IDLE, PARK_NOTIFIED, PARK_PARKED};
use crate::tls;
use crossbeam_queue::SegQueue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use weft_core::{FiberId, FiberState, SpinLock, WeftError, WeftResult};

/// How long an idle worker naps before rescanning the queues
const IDLE_NAP: Duration = Duration::from_micros(50);

/// A worker's local run queue, stealable by peers
struct WorkerQueue {
    ready: SpinLock<VecDeque<Arc<Fiber>>>,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            ready: SpinLock::new(VecDeque::new()),
        }
    }
}

/// The scheduler: worker pool plus run queues
pub struct Scheduler {
    /// Shared injector for externally-submitted and overflow fibers
    injector: SegQueue<Arc<Fiber>>,

    /// One local queue per worker
    locals: Vec<WorkerQueue>,

    /// Worker join handles
    handles: SpinLock<Vec<JoinHandle<()>>>,

    /// Accepting new work
    running: AtomicBool,

    stack_size: usize,
}

impl Scheduler {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        Self {
            injector: SegQueue::new(),
            locals: (0..config.workers).map(|_| WorkerQueue::new()).collect(),
            handles: SpinLock::new(Vec::new()),
            running: AtomicBool::new(false),
            stack_size: config.stack_size,
        }
    }

    /// Start the worker threads
    ///
    /// The scheduler lives in the process-wide runtime, so workers can
    /// reach it through `'static` borrows.
    pub(crate) fn start(&'static self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock();
        for i in 0..self.locals.len() {
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || worker_loop(self, i))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        log::debug!("scheduler started with {} workers", self.locals.len());
    }

    /// Create a fiber and queue it
    pub fn spawn<F>(&self, f: F) -> WeftResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) {
            return Err(WeftError::ShuttingDown);
        }
        let fiber = Fiber::with_stack_size(f, self.stack_size)?;
        let id = fiber.id();
        self.push_ready(fiber);
        Ok(id)
    }

    /// Queue a READY fiber
    ///
    /// From inside a worker the local queue is preferred; everyone else
    /// goes through the injector.
    pub(crate) fn push_ready(&self, fiber: Arc<Fiber>) {
        match tls::worker_id() {
            Some(id) if id < self.locals.len() => {
                self.locals[id].ready.lock().push_back(fiber);
            }
            _ => self.injector.push(fiber),
        }
    }

    /// Request stop; workers exit once the queues drain
    pub(crate) fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        // Fibers still parked at this point are abandoned; their storage
        // goes with the last Arc.
        log::debug!("scheduler stopped");
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn pop_local(&self, worker: usize) -> Option<Arc<Fiber>> {
        self.locals[worker].ready.lock().pop_front()
    }

    /// Steal the oldest fiber from some other worker
    fn steal(&self, thief: usize) -> Option<Arc<Fiber>> {
        let n = self.locals.len();
        for off in 1..n {
            let victim = (thief + off) % n;
            let taken = self.locals[victim].ready.lock().pop_front();
            if taken.is_some() {
                return taken;
            }
        }
        None
    }

    fn queues_empty(&self) -> bool {
        self.injector.is_empty() && self.locals.iter().all(|q| q.ready.lock().is_empty())
    }
}

fn worker_loop(sched: &'static Scheduler, worker: usize) {
    tls::set_worker_id(worker);

    loop {
        let next = sched
            .pop_local(worker)
            .or_else(|| sched.injector.pop())
            .or_else(|| sched.steal(worker));

        match next {
            Some(fiber) => run_fiber(sched, fiber),
            None => {
                if !sched.is_running() && sched.queues_empty() {
                    break;
                }
                thread::sleep(IDLE_NAP);
            }
        }
    }
}

/// Resume one fiber and dispose of it according to its post-switch state
fn run_fiber(sched: &Scheduler, fiber: Arc<Fiber>) {
    execute(&fiber);

    match fiber.state() {
        FiberState::Ready => {
            // Voluntary yield: back of the line
            sched.push_ready(fiber);
        }
        FiberState::Suspended => {
            complete_park(&fiber);
        }
        FiberState::Terminated => {
            // Dropping this Arc releases the stack once wait queues and
            // user handles have dropped theirs
        }
        FiberState::Running => {
            log::error!("fiber {} returned to scheduler while RUNNING", fiber.id());
        }
    }
}

/// Switch the calling thread into the fiber until it yields, parks or
/// terminates
pub(crate) fn execute(fiber: &Arc<Fiber>) {
    tls::set_current(fiber.clone());
    fiber.set_state(FiberState::Running);

    unsafe {
        arch::switch(tls::sched_ctx(), fiber.ctx_ptr());
    }

    tls::clear_current();
}

/// Finish a park after the fiber's registers are saved
///
/// If a wake arrived while the fiber was mid-switch (NOTIFIED), the park
/// is cancelled and the fiber requeues immediately.
pub(crate) fn complete_park(fiber: &Arc<Fiber>) {
    match fiber
        .park_word()
        .compare_exchange(PARK_IDLE, PARK_PARKED, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => {
            // Parked; the waker that pops the fiber from its wait
            // structure will requeue it
        }
        Err(_) => {
            fiber.park_word().store(PARK_IDLE, Ordering::Release);
            fiber.set_state(FiberState::Ready);
            crate::runtime::runtime().scheduler().push_ready(fiber.clone());
        }
    }
}

/// Wake a parked fiber
///
/// Caller must have removed the fiber from whatever wait structure held
/// it, so each suspension has exactly one waker. Returns false if the
/// fiber had already been notified.
pub(crate) fn ready(fiber: Arc<Fiber>) -> bool {
    loop {
        match fiber.park_word().compare_exchange(
            PARK_PARKED,
            PARK_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                fiber.set_state(FiberState::Ready);
                crate::runtime::runtime().scheduler().push_ready(fiber);
                return true;
            }
            Err(PARK_IDLE) => {
                // The fiber has not finished switching out yet; latch
                // the wake so complete_park requeues it
                if fiber
                    .park_word()
                    .compare_exchange(PARK_IDLE, PARK_NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
}

/// Park the current fiber
///
/// The caller must already have registered the fiber with whatever will
/// wake it (wait queue, fd slot, timer). Returns when woken.
pub(crate) fn park_current() {
    let fiber = tls::current().expect("park_current called outside a fiber");
    fiber.set_state(FiberState::Suspended);
    unsafe {
        arch::switch(fiber.ctx_ptr(), tls::sched_ctx());
    }
}

/// Surrender the worker; the fiber goes to the back of its run queue
///
/// Outside a fiber this yields the OS thread.
pub fn yield_now() {
    match tls::current() {
        Some(fiber) => {
            // State is set here but the requeue happens in run_fiber,
            // after the context switch has completed
            fiber.set_state(FiberState::Ready);
            unsafe {
                arch::switch(fiber.ctx_ptr(), tls::sched_ctx());
            }
        }
        None => thread::yield_now(),
    }
}
