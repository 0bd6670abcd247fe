//! The process-wide runtime
//!
//! Owns the scheduler, the timer wheel and the poller, plus the driver
//! thread that multiplexes epoll readiness with wheel ticks. Nothing
//! user-visible happens before the entry wrapper installs and starts
//! this object.

use crate::config::RuntimeConfig;
use crate::poller::Poller;
use crate::scheduler::Scheduler;
use crate::timer::TimerWheel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use weft_core::{FiberId, SpinLock, WeftError, WeftResult};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Scheduler + timer wheel + poller, started on first use
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Scheduler,
    wheel: TimerWheel,
    poller: Poller,
    started: AtomicBool,
    driver_running: AtomicBool,
    driver: SpinLock<Option<JoinHandle<()>>>,
}

impl Runtime {
    fn build(config: RuntimeConfig) -> WeftResult<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: Scheduler::new(&config),
            wheel: TimerWheel::new(config.wheel_slots, config.tick_ms),
            poller: Poller::new()?,
            started: AtomicBool::new(false),
            driver_running: AtomicBool::new(false),
            driver: SpinLock::new(None),
            config,
        })
    }

    /// Install the process-wide runtime with an explicit configuration
    ///
    /// Must happen before anything else touches the runtime; a second
    /// install (or an install after implicit default construction)
    /// fails with `Config`.
    pub fn init(config: RuntimeConfig) -> WeftResult<&'static Runtime> {
        let built = Runtime::build(config)?;
        let mut installed = false;
        let runtime = RUNTIME.get_or_init(|| {
            installed = true;
            built
        });
        if !installed {
            return Err(WeftError::Config("runtime already initialized"));
        }
        Ok(runtime)
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Start workers and the driver thread (idempotent)
    pub fn start(&'static self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scheduler.start();
        self.driver_running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("weft-driver".to_string())
            .spawn(move || self.driver_loop())
            .expect("failed to spawn driver thread");
        *self.driver.lock() = Some(handle);

        log::info!(
            "weft runtime started ({} workers, {} ms tick)",
            self.config.workers,
            self.config.tick_ms
        );
    }

    /// Spawn a fiber onto the runtime, starting it if necessary
    pub fn spawn<F>(&'static self, f: F) -> WeftResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start();
        self.scheduler.spawn(f)
    }

    /// Run `f` as a fiber and block the calling OS thread on the result
    ///
    /// This is the entry wrapper: the typical `main` calls `block_on`
    /// once and does everything inside.
    pub fn block_on<F, T>(&'static self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.spawn(move || {
            let _ = tx.send(f());
        })
        .expect("runtime is shutting down");

        match rx.recv() {
            Ok(value) => value,
            Err(_) => panic!("root fiber terminated without a result"),
        }
    }

    /// Stop accepting work, drain the workers, stop the driver
    ///
    /// Fibers still suspended are abandoned; their resources drop with
    /// their last owner. Callable from anywhere: a worker thread cannot
    /// join itself, so from inside a fiber the teardown is handed to a
    /// plain thread.
    pub fn shutdown(&'static self) {
        if crate::tls::worker_id().is_some() {
            let _ = thread::Builder::new()
                .name("weft-shutdown".to_string())
                .spawn(move || self.shutdown_inner());
            return;
        }
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.wheel.stop();
        self.scheduler.shutdown();
        self.driver_running.store(false, Ordering::Release);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
        log::info!("weft runtime stopped");
    }

    /// Driver loop: poll readiness, then advance the wheel by however
    /// many ticks have elapsed
    fn driver_loop(&self) {
        let tick = Duration::from_millis(self.config.tick_ms);
        let mut last_tick = Instant::now();

        while self.driver_running.load(Ordering::Acquire) {
            self.poller.poll(self.config.tick_ms as i32);

            let now = Instant::now();
            while now.duration_since(last_tick) >= tick {
                self.wheel.tick();
                last_tick += tick;
            }
        }
    }
}

/// The process-wide runtime, default-constructed on first touch
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        Runtime::build(RuntimeConfig::default()).expect("default runtime configuration is valid")
    })
}

/// Spawn a fiber onto the process-wide runtime
pub fn spawn<F>(f: F) -> WeftResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    runtime().spawn(f)
}

/// Run a closure as a fiber and wait for it
pub fn block_on<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    runtime().block_on(f)
}
