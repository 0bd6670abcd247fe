//! Bounded MPMC channel for fiber communication
//!
//! A send or recv that would block parks the calling fiber; the worker
//! thread stays free to run others. Capacity 0 is a rendezvous channel:
//! send and recv pair up directly without buffering.
//!
//! One coarse lock guards the buffer and both waiter queues, so the
//! structural invariant (senders and receivers are never queued at the
//! same time) is easy to maintain. Parked operations carry their value
//! in their own waiter node, which lets a timed-out operation be pulled
//! out of the queue before it returns.

use crate::fiber::Fiber;
use crate::{runtime, scheduler, tls};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use weft_core::{SpinLock, TryRecvError, TrySendError, WeftError, WeftResult};

/// Waiter states
const OP_WAITING: u8 = 0;
const OP_DELIVERED: u8 = 1;
const OP_CLOSED: u8 = 2;
const OP_TIMED_OUT: u8 = 3;

static NEXT_OP_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A parked send or recv: the value travels in the node
struct OpNode<T> {
    fiber: Arc<Fiber>,
    token: u64,
    status: AtomicU8,
    slot: SpinLock<Option<T>>,
}

impl<T> OpNode<T> {
    fn new(fiber: Arc<Fiber>, value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            fiber,
            token: NEXT_OP_TOKEN.fetch_add(1, Ordering::Relaxed),
            status: AtomicU8::new(OP_WAITING),
            slot: SpinLock::new(value),
        })
    }

    fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }
}

struct ChanInner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    senders: VecDeque<Arc<OpNode<T>>>,
    receivers: VecDeque<Arc<OpNode<T>>>,
    closed: bool,
}

/// A typed FIFO with optional buffering
///
/// Cloning the handle shares the channel.
pub struct Channel<T> {
    inner: Arc<SpinLock<ChanInner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel of capacity `capacity` (0 = rendezvous)
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SpinLock::new(ChanInner {
                capacity,
                buffer: VecDeque::with_capacity(capacity),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Send a value, parking while the channel is full
    ///
    /// Fails with `Closed` if the channel is (or becomes) closed.
    pub fn send(&self, value: T) -> WeftResult<()> {
        if !tls::is_in_fiber() {
            return self.send_spinning(value);
        }

        let node = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(WeftError::Closed);
            }

            // A queued receiver implies an empty buffer: hand off
            if let Some(receiver) = inner.receivers.pop_front() {
                drop(inner);
                *receiver.slot.lock() = Some(value);
                receiver.status.store(OP_DELIVERED, Ordering::Release);
                scheduler::ready(receiver.fiber.clone());
                return Ok(());
            }

            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                return Ok(());
            }

            // Full (or rendezvous with nobody waiting): park with the
            // value in our node
            let fiber = tls::current().expect("send inside a fiber");
            let node = OpNode::new(fiber, Some(value));
            inner.senders.push_back(node.clone());
            node
        };

        scheduler::park_current();
        self.finish_send(&node)
    }

    /// Send with a deadline; on timeout the queued operation is
    /// withdrawn before returning and the value is dropped
    pub fn send_timeout(&self, value: T, timeout_ms: u64) -> WeftResult<()> {
        if !tls::is_in_fiber() {
            return self.send_spinning(value);
        }

        let node = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(WeftError::Closed);
            }
            if let Some(receiver) = inner.receivers.pop_front() {
                drop(inner);
                *receiver.slot.lock() = Some(value);
                receiver.status.store(OP_DELIVERED, Ordering::Release);
                scheduler::ready(receiver.fiber.clone());
                return Ok(());
            }
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                return Ok(());
            }
            let fiber = tls::current().expect("send inside a fiber");
            let node = OpNode::new(fiber, Some(value));
            inner.senders.push_back(node.clone());
            node
        };

        let timer = self.arm_removal_timer(&node, timeout_ms, QueueSide::Senders);
        if timer.is_none() && self.withdraw(&node, QueueSide::Senders) {
            // Wheel is gone (shutdown) and nothing else will wake us
            return Err(WeftError::ShuttingDown);
        }
        scheduler::park_current();
        if let Some(handle) = timer {
            runtime::runtime().wheel().cancel(&handle);
        }
        self.finish_send(&node)
    }

    fn finish_send(&self, node: &Arc<OpNode<T>>) -> WeftResult<()> {
        match node.status() {
            OP_DELIVERED => Ok(()),
            OP_CLOSED => Err(WeftError::Closed),
            OP_TIMED_OUT => Err(WeftError::Timeout),
            _ => Err(WeftError::Invariant("sender woke without an outcome")),
        }
    }

    /// Receive a value, parking while the channel is empty
    ///
    /// A closed channel drains its remaining buffer before reporting
    /// `Closed`.
    pub fn recv(&self) -> WeftResult<T> {
        if !tls::is_in_fiber() {
            return self.recv_spinning();
        }

        let node = {
            let mut inner = self.inner.lock();

            if let Some(value) = self.pop_locked(&mut inner) {
                return Ok(value);
            }
            if inner.closed {
                return Err(WeftError::Closed);
            }

            let fiber = tls::current().expect("recv inside a fiber");
            let node = OpNode::new(fiber, None);
            inner.receivers.push_back(node.clone());
            node
        };

        scheduler::park_current();
        self.finish_recv(&node)
    }

    /// Receive with a deadline; on timeout the queued operation is
    /// withdrawn before returning
    pub fn recv_timeout(&self, timeout_ms: u64) -> WeftResult<T> {
        if !tls::is_in_fiber() {
            return self.recv_spinning();
        }

        let node = {
            let mut inner = self.inner.lock();
            if let Some(value) = self.pop_locked(&mut inner) {
                return Ok(value);
            }
            if inner.closed {
                return Err(WeftError::Closed);
            }
            let fiber = tls::current().expect("recv inside a fiber");
            let node = OpNode::new(fiber, None);
            inner.receivers.push_back(node.clone());
            node
        };

        let timer = self.arm_removal_timer(&node, timeout_ms, QueueSide::Receivers);
        if timer.is_none() && self.withdraw(&node, QueueSide::Receivers) {
            return Err(WeftError::ShuttingDown);
        }
        scheduler::park_current();
        if let Some(handle) = timer {
            runtime::runtime().wheel().cancel(&handle);
        }
        self.finish_recv(&node)
    }

    fn finish_recv(&self, node: &Arc<OpNode<T>>) -> WeftResult<T> {
        match node.status() {
            OP_DELIVERED => match node.slot.lock().take() {
                Some(value) => Ok(value),
                None => Err(WeftError::Invariant("delivered receiver has no value")),
            },
            OP_CLOSED => Err(WeftError::Closed),
            OP_TIMED_OUT => Err(WeftError::Timeout),
            _ => Err(WeftError::Invariant("receiver woke without an outcome")),
        }
    }

    /// Pop from the buffer (promoting a queued sender) or take a queued
    /// sender's value directly (rendezvous)
    ///
    /// Wakes any promoted/paired sender. Caller holds the lock; the wake
    /// happens with the lock held, which is fine because `ready` only
    /// touches the fiber's park word and a run queue.
    fn pop_locked(&self, inner: &mut ChanInner<T>) -> Option<T> {
        if let Some(value) = inner.buffer.pop_front() {
            if let Some(sender) = inner.senders.pop_front() {
                if let Some(queued) = sender.slot.lock().take() {
                    inner.buffer.push_back(queued);
                }
                sender.status.store(OP_DELIVERED, Ordering::Release);
                scheduler::ready(sender.fiber.clone());
            }
            return Some(value);
        }

        // Rendezvous pairing
        if let Some(sender) = inner.senders.pop_front() {
            let value = sender.slot.lock().take();
            sender.status.store(OP_DELIVERED, Ordering::Release);
            scheduler::ready(sender.fiber.clone());
            return value;
        }

        None
    }

    /// Non-blocking send
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TrySendError(value));
        }
        if let Some(receiver) = inner.receivers.pop_front() {
            drop(inner);
            *receiver.slot.lock() = Some(value);
            receiver.status.store(OP_DELIVERED, Ordering::Release);
            scheduler::ready(receiver.fiber.clone());
            return Ok(());
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError(value))
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.lock();
        self.pop_locked(&mut inner).ok_or(TryRecvError)
    }

    /// Close the channel
    ///
    /// Queued senders wake with `Closed` (their values are dropped);
    /// queued receivers wake with `Closed` (the buffer is empty whenever
    /// receivers are queued). Later sends fail; later recvs drain the
    /// buffer first.
    pub fn close(&self) {
        let (senders, receivers) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                inner.senders.drain(..).collect::<Vec<_>>(),
                inner.receivers.drain(..).collect::<Vec<_>>(),
            )
        };

        for node in senders.into_iter().chain(receivers) {
            node.status.store(OP_CLOSED, Ordering::Release);
            scheduler::ready(node.fiber.clone());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Buffered values right now
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Pull our own node back out of a waiter queue; false when someone
    /// already took it (a wake is in flight, parking is safe)
    fn withdraw(&self, node: &Arc<OpNode<T>>, side: QueueSide) -> bool {
        let mut inner = self.inner.lock();
        let queue = match side {
            QueueSide::Senders => &mut inner.senders,
            QueueSide::Receivers => &mut inner.receivers,
        };
        match queue.iter().position(|n| n.token == node.token) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Arm a timer that withdraws a parked operation on timeout
    fn arm_removal_timer(
        &self,
        node: &Arc<OpNode<T>>,
        timeout_ms: u64,
        side: QueueSide,
    ) -> Option<crate::timer::TimerHandle> {
        let weak: Weak<SpinLock<ChanInner<T>>> = Arc::downgrade(&self.inner);
        let token = node.token;
        runtime::runtime()
            .wheel()
            .add(
                timeout_ms as i64,
                move || {
                    let inner = match weak.upgrade() {
                        Some(inner) => inner,
                        None => return,
                    };
                    let removed = {
                        let mut inner = inner.lock();
                        let queue = match side {
                            QueueSide::Senders => &mut inner.senders,
                            QueueSide::Receivers => &mut inner.receivers,
                        };
                        queue
                            .iter()
                            .position(|n| n.token == token)
                            .and_then(|pos| queue.remove(pos))
                    };
                    if let Some(node) = removed {
                        node.status.store(OP_TIMED_OUT, Ordering::Release);
                        scheduler::ready(node.fiber.clone());
                    }
                },
                false,
            )
            .ok()
    }

    /// Non-fiber fallback: spin on the try variants
    fn send_spinning(&self, mut value: T) -> WeftResult<()> {
        loop {
            if self.is_closed() {
                return Err(WeftError::Closed);
            }
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError(v)) => {
                    value = v;
                    std::thread::yield_now();
                }
            }
        }
    }

    fn recv_spinning(&self) -> WeftResult<T> {
        loop {
            match self.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError) => {
                    if self.is_closed() {
                        return Err(WeftError::Closed);
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum QueueSide {
    Senders,
    Receivers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_send_try_recv() {
        let ch: Channel<u32> = Channel::new(2);
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        assert!(ch.try_send(3).is_err());
        assert_eq!(ch.len(), 2);

        assert_eq!(ch.try_recv().unwrap(), 1);
        assert_eq!(ch.try_recv().unwrap(), 2);
        assert!(ch.try_recv().is_err());
    }

    #[test]
    fn test_try_send_on_closed() {
        let ch: Channel<u32> = Channel::new(2);
        ch.close();
        assert!(ch.is_closed());
        assert!(ch.try_send(1).is_err());
    }

    #[test]
    fn test_capacity_bound_holds() {
        let ch: Channel<u32> = Channel::new(3);
        for i in 0..3 {
            ch.try_send(i).unwrap();
        }
        assert!(ch.try_send(99).is_err());
        assert!(ch.len() <= ch.capacity());
    }

    #[test]
    fn test_rendezvous_try_send_fails_without_receiver() {
        let ch: Channel<u32> = Channel::new(0);
        assert!(ch.try_send(1).is_err());
    }

    #[test]
    fn test_fifo_order_in_buffer() {
        let ch: Channel<u32> = Channel::new(8);
        for i in 0..5 {
            ch.try_send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(ch.try_recv().unwrap(), i);
        }
    }
}
