//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber
///
/// Assigned from a process-wide monotonic counter starting at 1.
/// Zero is reserved as a sentinel for "no fiber".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next fiber id from the monotonic counter
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a valid fiber id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b.as_u64() > a.as_u64());
        assert!(a.is_some());
        assert!(!a.is_none());
    }

    #[test]
    fn test_fiber_id_none() {
        let none = FiberId::NONE;
        assert!(none.is_none());
        assert!(!none.is_some());
        assert_eq!(format!("{}", none), "none");
    }
}
