//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// Bad parameter at construction or registration
    Config(&'static str),

    /// Library misuse (unlock by non-owner, wait-group below zero, ...)
    Invariant(&'static str),

    /// A single-waiter slot is already taken
    Busy,

    /// A deadline elapsed
    Timeout,

    /// Peer or local close observed during the operation
    Closed,

    /// Underlying system call failure (errno)
    Io(i32),

    /// The codec could not consume the expected structure
    Decode(&'static str),

    /// RPC method lookup failed
    NotFound,

    /// A handler returned an explicit error message
    Application(String),

    /// Submission after the scheduler was stopped
    ShuttingDown,
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            WeftError::Invariant(msg) => write!(f, "invariant violated: {}", msg),
            WeftError::Busy => write!(f, "slot already taken"),
            WeftError::Timeout => write!(f, "operation timed out"),
            WeftError::Closed => write!(f, "closed"),
            WeftError::Io(errno) => write!(f, "io error (errno {})", errno),
            WeftError::Decode(msg) => write!(f, "decode error: {}", msg),
            WeftError::NotFound => write!(f, "method not found"),
            WeftError::Application(msg) => write!(f, "application error: {}", msg),
            WeftError::ShuttingDown => write!(f, "runtime is shutting down"),
        }
    }
}

impl std::error::Error for WeftError {}

/// Error returned when trying to send on a full (or closed) channel
///
/// Carries the value back so the caller can retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrySendError<T>(pub T);

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel full")
    }
}

/// Error returned when trying to receive from an empty channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryRecvError;

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = WeftError::Timeout;
        assert_eq!(format!("{}", e), "operation timed out");

        let e = WeftError::Io(11);
        assert_eq!(format!("{}", e), "io error (errno 11)");

        let e = WeftError::Application("divide by zero".to_string());
        assert_eq!(format!("{}", e), "application error: divide by zero");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(WeftError::Busy, WeftError::Busy);
        assert_ne!(WeftError::Busy, WeftError::Timeout);
        assert_eq!(
            WeftError::Config("stack size must be non-zero"),
            WeftError::Config("stack size must be non-zero")
        );
    }
}
