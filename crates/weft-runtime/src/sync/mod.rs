//! Fiber-aware synchronization primitives
//!
//! - `FiberMutex` / `FiberMutexGuard` - parking mutex with RAII guard
//! - `FiberCondition` - condition variable with timed wait
//! - `WaitGroup` - Go-style completion counter
//! - `Channel` - bounded / rendezvous FIFO with close and timed variants

pub mod channel;
pub mod condition;
pub mod mutex;
pub mod wait_group;

pub use channel::Channel;
pub use condition::FiberCondition;
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use wait_group::WaitGroup;
