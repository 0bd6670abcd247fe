//! Internal ticket spinlock
//!
//! Guards the runtime's short critical sections: run queues, channel
//! state, the poller's fd table, the server's method table. Those
//! sections never contain a suspension point, so a brief spin beats
//! parking machinery. Tickets hand the lock over in arrival order,
//! which keeps the queue-heavy call sites fair when several workers
//! hammer the same channel.
//!
//! Not for user code: fibers that need mutual exclusion use
//! `FiberMutex`, which parks the fiber instead of burning the worker.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// How many spins before conceding the timeslice
const SPINS_BEFORE_YIELD: u32 = 256;

/// A FIFO spinlock
///
/// An acquirer draws a ticket; the holder's release advances the serving
/// counter, so waiters get in strictly in the order they arrived. Both
/// counters wrap freely — only equality matters.
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    serving: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: the ticket discipline gives the holder exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new lock containing the given value
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            next_ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until our ticket comes up
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut spins = 0u32;
        while self.serving.load(Ordering::Acquire) != ticket {
            spins = spins.wrapping_add(1);
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard { lock: self }
    }
}

/// Guard that passes the lock to the next ticket when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: our ticket is being served
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: our ticket is being served
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // The shape the rpc server uses: a registration table filled from
    // one place, read from many
    #[test]
    fn test_guards_a_method_table() {
        let table: SpinLock<HashMap<String, u32>> = SpinLock::new(HashMap::new());

        {
            let mut map = table.lock();
            map.insert("echo".to_string(), 1);
            map.insert("divide".to_string(), 2);
        }

        let map = table.lock();
        assert_eq!(map.get("echo"), Some(&1));
        assert_eq!(map.get("divide"), Some(&2));
        assert_eq!(map.get("missing"), None);
    }

    // The shape a channel uses: producers appending to a VecDeque while
    // a consumer drains it, nothing lost or duplicated
    #[test]
    fn test_concurrent_queue_traffic() {
        let queue: Arc<SpinLock<VecDeque<u32>>> = Arc::new(SpinLock::new(VecDeque::new()));
        let producers = 3u32;
        let per_producer = 200u32;

        let mut handles = Vec::new();
        for id in 0..producers {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for _ in 0..per_producer {
                    queue.lock().push_back(id);
                }
            }));
        }

        let mut counts = [0u32; 3];
        let mut drained = 0;
        while drained < producers * per_producer {
            let popped = queue.lock().pop_front();
            if let Some(id) = popped {
                counts[id as usize] += 1;
                drained += 1;
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counts, [per_producer; 3]);
        assert!(queue.lock().is_empty());
    }

    // Tickets serve waiters in arrival order
    #[test]
    fn test_handoff_follows_arrival_order() {
        let order: Arc<SpinLock<Vec<usize>>> = Arc::new(SpinLock::new(Vec::new()));

        let gate = order.lock();
        let mut handles = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                // Stagger arrivals so the ticket order is known
                thread::sleep(Duration::from_millis(20 * (i as u64 + 1)));
                order.lock().push(i);
            }));
        }

        // Let all three queue up behind us, then hand the lock over
        thread::sleep(Duration::from_millis(120));
        drop(gate);

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
