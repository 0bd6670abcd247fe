//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended lock parks the fiber instead
//! of blocking the OS thread, so the worker keeps running other fibers.
//! No recursion; FIFO handoff among waiters via the wait queue.

use crate::wait_queue::WaitQueue;
use crate::tls;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use weft_core::{WeftError, WeftResult};

/// Owner tag for "unlocked"
const NO_OWNER: u64 = 0;

/// A mutex that parks fibers when contended
///
/// Holds its protected data, releases on guard drop. Outside a fiber the
/// lock degrades to a yielding spin so non-fiber threads (tests, setup
/// code) can still use it.
pub struct FiberMutex<T> {
    /// Id of the owning fiber, or NO_OWNER
    owner: AtomicU64,
    data: UnsafeCell<T>,
    waiters: WaitQueue,
}

// Safety: FiberMutex provides exclusive access to T
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    /// Create a new mutex containing the given value
    pub fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            data: UnsafeCell::new(value),
            waiters: WaitQueue::new(),
        }
    }

    /// Tag identifying this thread of control as an owner
    ///
    /// Fibers use their id; bare OS threads get a synthetic tag so the
    /// spin fallback still enforces exclusion.
    fn self_tag() -> u64 {
        match tls::current() {
            Some(fiber) => fiber.id().as_u64(),
            None => {
                // High bit marks non-fiber owners; thread ids never
                // collide with fiber ids that way
                let tid = unsafe { libc::pthread_self() } as u64;
                tid | (1 << 63)
            }
        }
    }

    fn try_acquire(&self, tag: u64) -> bool {
        self.owner
            .compare_exchange(NO_OWNER, tag, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the lock, parking the fiber if contended
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        let tag = Self::self_tag();

        if self.try_acquire(tag) {
            return FiberMutexGuard { mutex: self };
        }

        if tls::is_in_fiber() {
            loop {
                if self.waiters.wait_unless(|| self.try_acquire(tag)) {
                    return FiberMutexGuard { mutex: self };
                }
                // Woken by an unlock; contend again
                if self.try_acquire(tag) {
                    return FiberMutexGuard { mutex: self };
                }
            }
        } else {
            // Non-fiber fallback: yield the OS thread until free
            loop {
                if self.try_acquire(tag) {
                    return FiberMutexGuard { mutex: self };
                }
                std::thread::yield_now();
            }
        }
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        if self.try_acquire(Self::self_tag()) {
            Some(FiberMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Whether the calling fiber holds the lock
    pub fn is_locked_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == Self::self_tag()
    }

    /// Release the lock; only the owner may do this
    pub(crate) fn unlock(&self) -> WeftResult<()> {
        let tag = Self::self_tag();
        if self
            .owner
            .compare_exchange(tag, NO_OWNER, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return Err(WeftError::Invariant("unlock by non-owner"));
        }
        self.waiters.notify_one();
        Ok(())
    }

    /// Get mutable access without locking (requires unique borrow)
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; unlocks on drop
pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T> FiberMutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a FiberMutex<T> {
        self.mutex
    }
}

impl<'a, T> Deref for FiberMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for FiberMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            // Unreachable through the guard API; a dropped guard is
            // always held by its creator
            log::error!("mutex unlock failed: {}", e);
        }
    }
}
