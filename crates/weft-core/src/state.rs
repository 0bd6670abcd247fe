//! Fiber lifecycle state

use core::fmt;

/// State of a fiber
///
/// Created in `Ready`; a worker moves it to `Running`; a voluntary
/// suspension point moves it to `Suspended`; a notification moves it
/// back to `Ready`; when the entry returns or unwinds it becomes
/// `Terminated` and its storage is reclaimed with the last owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Ready to run, queued or about to be queued
    Ready = 0,

    /// Currently executing on exactly one worker
    Running = 1,

    /// Parked in a wait queue, timer, or fd slot
    Suspended = 2,

    /// Entry returned or unwound; awaiting reclamation
    Terminated = 3,
}

impl FiberState {
    /// Check if this state allows the fiber to be scheduled
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has finished
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Terminated)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Suspended,
            _ => FiberState::Terminated,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Suspended => write!(f, "SUSPENDED"),
            FiberState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(!FiberState::Suspended.is_runnable());
        assert!(FiberState::Terminated.is_terminated());
        assert!(!FiberState::Suspended.is_terminated());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            FiberState::Ready,
            FiberState::Running,
            FiberState::Suspended,
            FiberState::Terminated,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }
}
