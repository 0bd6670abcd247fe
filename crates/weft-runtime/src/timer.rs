//! Hashed timing wheel
//!
//! 256 slots at a fixed tick resolution (1 ms by default). A timer whose
//! delay exceeds one revolution carries a rotation count and is skipped
//! until it reaches zero. Registration from any thread goes through a
//! lock-free pending queue that the driver drains at tick time, so the
//! wheel itself is only ever mutated by the driver.
//!
//! Callbacks run on the driver and must not block; heavy work should
//! spawn a fiber.

use crossbeam_queue::ArrayQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use weft_core::{SpinLock, WeftError, WeftResult};

/// Capacity of the pending-registration queue
const PENDING_CAPACITY: usize = 4096;

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A single registered timer
pub struct TimerEntry {
    delay_ms: u64,
    callback: Callback,
    repeat: bool,
    cancelled: AtomicBool,
    fired: AtomicBool,
    /// Remaining full revolutions before this entry is due; only the
    /// driver touches it once the entry sits in a slot
    rotations: SpinLock<u64>,
}

/// Handle returned to the creator of a timer
pub type TimerHandle = Arc<TimerEntry>;

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("delay_ms", &self.delay_ms)
            .field("repeat", &self.repeat)
            .field("cancelled", &self.cancelled)
            .field("fired", &self.fired)
            .finish()
    }
}

impl TimerEntry {
    /// Whether the callback has run at least once
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct WheelState {
    slots: Vec<Vec<TimerHandle>>,
    current: usize,
}

/// The timing wheel
pub struct TimerWheel {
    state: SpinLock<WheelState>,
    pending: ArrayQueue<TimerHandle>,
    tick_ms: u64,
    slot_count: usize,
    running: AtomicBool,
}

impl TimerWheel {
    pub(crate) fn new(slot_count: usize, tick_ms: u64) -> Self {
        Self {
            state: SpinLock::new(WheelState {
                slots: (0..slot_count).map(|_| Vec::new()).collect(),
                current: 0,
            }),
            pending: ArrayQueue::new(PENDING_CAPACITY),
            tick_ms,
            slot_count,
            running: AtomicBool::new(true),
        }
    }

    /// Tick resolution in milliseconds
    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Register a timer
    ///
    /// The callback fires after roughly `delay_ms` milliseconds
    /// (quantized to the tick resolution, minimum one tick). With
    /// `repeat` it refires every `delay_ms` until cancelled.
    pub fn add<F>(&self, delay_ms: i64, callback: F, repeat: bool) -> WeftResult<TimerHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if delay_ms < 0 {
            return Err(WeftError::Config("timer delay must be non-negative"));
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(WeftError::ShuttingDown);
        }

        let entry = Arc::new(TimerEntry {
            delay_ms: delay_ms as u64,
            callback: Arc::new(callback),
            repeat,
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            rotations: SpinLock::new(0),
        });

        self.submit(entry.clone());
        Ok(entry)
    }

    fn submit(&self, entry: TimerHandle) {
        let mut pending = entry;
        // If the queue is momentarily full the driver is behind; give it
        // the thread and retry
        loop {
            match self.pending.push(pending) {
                Ok(()) => return,
                Err(returned) => {
                    std::thread::yield_now();
                    pending = returned;
                }
            }
        }
    }

    /// Cancel a timer
    ///
    /// Returns false if the timer already fired (and does not repeat) or
    /// was already cancelled; its callback will not run again either way.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let was_cancelled = handle.cancelled.swap(true, Ordering::AcqRel);
        if was_cancelled {
            return false;
        }
        !(handle.fired.load(Ordering::Acquire) && !handle.repeat)
    }

    /// Atomically replace a pending timer with a fresh deadline
    ///
    /// The old handle is cancelled; the returned handle carries the same
    /// callback, delay and repeat flag.
    pub fn refresh(&self, handle: &TimerHandle) -> WeftResult<TimerHandle> {
        if handle.cancelled.swap(true, Ordering::AcqRel) {
            return Err(WeftError::Invariant("cannot refresh a cancelled timer"));
        }

        let entry = Arc::new(TimerEntry {
            delay_ms: handle.delay_ms,
            callback: handle.callback.clone(),
            repeat: handle.repeat,
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            rotations: SpinLock::new(0),
        });
        self.submit(entry.clone());
        Ok(entry)
    }

    /// Fire a timer immediately, cancelling its scheduled deadline
    pub fn trigger_now(&self, handle: &TimerHandle) {
        if handle.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        handle.fired.store(true, Ordering::Release);
        run_callback(&handle.callback);
    }

    /// Stop accepting registrations
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Advance the wheel by one tick, firing due timers
    ///
    /// Driver-only. Callbacks run after the wheel lock is released so
    /// they may register further timers or wake fibers freely.
    pub(crate) fn tick(&self) {
        let mut due: Vec<TimerHandle> = Vec::new();

        {
            let mut state = self.state.lock();

            // Place newly registered timers
            let mut placed = 0;
            while placed < PENDING_CAPACITY {
                let entry = match self.pending.pop() {
                    Some(e) => e,
                    None => break,
                };
                placed += 1;
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                let mut ticks = entry.delay_ms / self.tick_ms;
                if ticks == 0 {
                    ticks = 1;
                }
                let slot = (state.current + ticks as usize) % self.slot_count;
                *entry.rotations.lock() = ticks / self.slot_count as u64;
                state.slots[slot].push(entry);
            }

            // Process the current slot
            let current = state.current;
            let mut keep: Vec<TimerHandle> = Vec::new();
            let mut reinsert: Vec<(usize, TimerHandle)> = Vec::new();

            for entry in state.slots[current].drain(..) {
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }

                let mut rotations = entry.rotations.lock();
                if *rotations > 0 {
                    *rotations -= 1;
                    drop(rotations);
                    keep.push(entry);
                    continue;
                }
                drop(rotations);

                entry.fired.store(true, Ordering::Release);
                if entry.repeat {
                    let mut ticks = entry.delay_ms / self.tick_ms;
                    if ticks == 0 {
                        ticks = 1;
                    }
                    let slot = (current + ticks as usize) % self.slot_count;
                    *entry.rotations.lock() = ticks / self.slot_count as u64;
                    reinsert.push((slot, entry.clone()));
                }
                due.push(entry);
            }

            state.slots[current] = keep;
            for (slot, entry) in reinsert {
                state.slots[slot].push(entry);
            }
            state.current = (current + 1) % self.slot_count;
        }

        for entry in due {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            run_callback(&entry.callback);
        }
    }
}

/// Callbacks must not take the wheel down with them
fn run_callback(cb: &Callback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb())) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        log::error!("timer callback panicked: {}", msg);
    }
}

/// Suspend the current fiber for `ms` milliseconds
///
/// `sleep_ms(0)` is a plain yield. Outside a fiber this blocks the OS
/// thread instead.
pub fn sleep_ms(ms: u64) {
    if ms == 0 {
        crate::scheduler::yield_now();
        return;
    }
    let fiber = match crate::tls::current() {
        Some(f) => f,
        None => {
            std::thread::sleep(std::time::Duration::from_millis(ms));
            return;
        }
    };

    let wheel = crate::runtime::runtime().wheel();
    let waker = fiber.clone();
    let timer = wheel.add(
        ms as i64,
        move || {
            crate::scheduler::ready(waker.clone());
        },
        false,
    );
    match timer {
        Ok(_) => crate::scheduler::park_current(),
        Err(_) => crate::scheduler::yield_now(),
    }
}

/// Suspend the current fiber for the given duration
pub fn sleep(duration: std::time::Duration) {
    sleep_ms(duration.as_millis() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wheel() -> TimerWheel {
        TimerWheel::new(256, 1)
    }

    // A timer of k ticks is placed k slots ahead by the tick that drains
    // the pending queue, so it fires on the (k+1)th tick after `add`.

    #[test]
    fn test_fires_after_delay_ticks() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        w.add(5, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, false)
        .unwrap();

        for _ in 0..5 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        w.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Never fires again
        for _ in 0..600 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_delay_rounds_to_one_tick() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        w.add(0, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, false)
        .unwrap();
        w.tick();
        w.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let w = wheel();
        let err = w.add(-1, || {}, false).unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn test_cancel_before_firing() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = w
            .add(3, move || {
                c.fetch_add(1, Ordering::SeqCst);
            }, false)
            .unwrap();

        assert!(w.cancel(&handle));
        for _ in 0..10 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_firing_returns_false() {
        let w = wheel();
        let handle = w.add(1, || {}, false).unwrap();
        w.tick();
        w.tick();
        assert!(handle.has_fired());
        assert!(!w.cancel(&handle));
    }

    #[test]
    fn test_repeating_timer_refires() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = w
            .add(2, move || {
                c.fetch_add(1, Ordering::SeqCst);
            }, true)
            .unwrap();

        // Fires on ticks 3, 5 and 7
        for _ in 0..7 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Cancelling a repeating timer after it has fired still works
        assert!(w.cancel(&handle));
        for _ in 0..6 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rotation_beyond_one_revolution() {
        let w = TimerWheel::new(4, 1);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        // 10 ticks on a 4-slot wheel: slot 2 with two full rotations,
        // so the entry fires the third time its slot comes around
        w.add(10, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, false)
        .unwrap();

        for _ in 0..10 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        w.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_replaces_deadline() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = w
            .add(3, move || {
                c.fetch_add(1, Ordering::SeqCst);
            }, false)
            .unwrap();

        w.tick();
        w.tick();
        // Two ticks in; refresh pushes the deadline three ticks out again
        let fresh = w.refresh(&handle).unwrap();
        for _ in 0..3 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        w.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(fresh.has_fired());
        assert!(!handle.has_fired());
    }

    #[test]
    fn test_trigger_now() {
        let w = wheel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = w
            .add(100, move || {
                c.fetch_add(1, Ordering::SeqCst);
            }, false)
            .unwrap();

        w.trigger_now(&handle);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The scheduled deadline is dead
        for _ in 0..300 {
            w.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let w = wheel();
        w.add(1, || panic!("timer boom"), false).unwrap();
        w.tick();
        w.tick();
        // Wheel still usable
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        w.add(1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, false)
        .unwrap();
        w.tick();
        w.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
