//! # weft-runtime
//!
//! Cooperative fiber runtime: M:N lightweight tasks on a worker-thread
//! pool, an epoll-driven readiness poller, a hashed timer wheel, and
//! fiber-aware synchronization primitives.
//!
//! ## Layout
//!
//! - `arch` - context switch assembly (x86_64, aarch64)
//! - `stack` - mmap'd fiber stacks with guard pages
//! - `fiber` - the fiber primitive and explicit `resume`
//! - `scheduler` - worker pool, run queues, park/wake protocol
//! - `wait_queue` - FIFO of suspended fibers
//! - `timer` - hashed timing wheel and `sleep`
//! - `poller` / `io` - epoll readiness and fiber-blocking I/O
//! - `sync` - mutex, condition, wait group, channel
//! - `runtime` - the process-wide runtime object and entry wrapper

pub mod arch;
pub mod config;
pub mod fiber;
pub mod io;
pub mod poller;
pub mod runtime;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod tls;
pub mod wait_queue;

pub use config::RuntimeConfig;
pub use fiber::{resume, ExitDisposition, Fiber};
pub use runtime::{block_on, runtime, spawn, Runtime};
pub use scheduler::yield_now;
pub use sync::{Channel, FiberCondition, FiberMutex, FiberMutexGuard, WaitGroup};
pub use timer::{sleep, sleep_ms, TimerHandle, TimerWheel};
pub use tls::{current, is_in_fiber};
pub use wait_queue::WaitQueue;
