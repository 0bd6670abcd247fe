//! Architecture-specific context switching
//!
//! Each supported architecture provides:
//! - `SavedContext` - the callee-saved register set of a parked fiber
//! - `init_context` - prepare a fresh context so that the first switch
//!   into it lands in the entry trampoline
//! - `switch` - save the current callee-saved state and load another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{SavedContext, init_context, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{SavedContext, init_context, switch};
    } else {
        compile_error!("Unsupported architecture");
    }
}
