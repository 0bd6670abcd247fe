//! # weft-core
//!
//! Core types for the weft fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The runtime proper (context switching, scheduler, poller) lives in
//! `weft-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle state enum
//! - `error` - Error taxonomy shared by every crate in the workspace
//! - `spinlock` - Internal spinlock primitive
//! - `env` - Environment variable utilities

pub mod env;
pub mod error;
pub mod id;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{TryRecvError, TrySendError, WeftError, WeftResult};
pub use id::FiberId;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use state::FiberState;
