//! Readiness poller over epoll
//!
//! Maps each registered fd to one readable-waiter slot and one
//! writable-waiter slot (a second concurrent waiter in a direction is a
//! `Busy` error). The driver thread multiplexes `epoll_wait` with the
//! timer wheel: the wait timeout is the tick resolution, and the wheel
//! advances by however many ticks elapsed.
//!
//! Wake rules: readiness, timeout, and close each try to take the waiter
//! out of its slot under the table lock, so exactly one of them wins and
//! the others see an empty slot.

use crate::fiber::Fiber;
use crate::scheduler;
use crate::stack::last_errno;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use weft_core::{SpinLock, WeftError, WeftResult};

/// Direction of interest for a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Waiter outcomes
pub(crate) const IO_PENDING: u8 = 0;
pub(crate) const IO_READY: u8 = 1;
pub(crate) const IO_TIMED_OUT: u8 = 2;
pub(crate) const IO_CLOSED: u8 = 3;

/// A fiber parked on fd readiness
pub(crate) struct IoWaiter {
    pub(crate) fiber: Arc<Fiber>,
    pub(crate) outcome: AtomicU8,
}

impl IoWaiter {
    pub(crate) fn new(fiber: Arc<Fiber>) -> Arc<Self> {
        Arc::new(Self {
            fiber,
            outcome: AtomicU8::new(IO_PENDING),
        })
    }

    pub(crate) fn outcome(&self) -> u8 {
        self.outcome.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct FdRecord {
    read: Option<Arc<IoWaiter>>,
    write: Option<Arc<IoWaiter>>,
    /// Events currently registered with epoll for this fd
    registered: u32,
}

impl FdRecord {
    fn wanted_events(&self) -> u32 {
        let mut events = 0;
        if self.read.is_some() {
            events |= libc::EPOLLIN as u32;
        }
        if self.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// The fd readiness table plus the epoll instance
pub struct Poller {
    epfd: RawFd,
    fds: SpinLock<HashMap<RawFd, FdRecord>>,
}

impl Poller {
    pub(crate) fn new() -> WeftResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(WeftError::Io(last_errno()));
        }
        Ok(Self {
            epfd,
            fds: SpinLock::new(HashMap::new()),
        })
    }

    /// Park-side registration: install `waiter` in the fd's slot for the
    /// given direction and arm epoll
    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        waiter: Arc<IoWaiter>,
    ) -> WeftResult<()> {
        let mut fds = self.fds.lock();
        let record = fds.entry(fd).or_default();

        let slot = match interest {
            Interest::Read => &mut record.read,
            Interest::Write => &mut record.write,
        };
        if slot.is_some() {
            return Err(WeftError::Busy);
        }
        *slot = Some(waiter);

        if let Err(e) = self.sync_epoll(fd, record) {
            // Roll the slot back; nothing will ever wake this waiter
            match interest {
                Interest::Read => record.read = None,
                Interest::Write => record.write = None,
            }
            if record.registered == 0 {
                fds.remove(&fd);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Take the waiter back out, but only if it is still the same one
    ///
    /// Timer callbacks use this; returns false when readiness or close
    /// already claimed the waiter.
    pub(crate) fn retract(&self, fd: RawFd, interest: Interest, waiter: &Arc<IoWaiter>) -> bool {
        let mut fds = self.fds.lock();
        let record = match fds.get_mut(&fd) {
            Some(r) => r,
            None => return false,
        };
        let slot = match interest {
            Interest::Read => &mut record.read,
            Interest::Write => &mut record.write,
        };
        match slot {
            Some(current) if Arc::ptr_eq(current, waiter) => {
                *slot = None;
                let _ = self.sync_epoll(fd, record);
                if record.read.is_none() && record.write.is_none() {
                    fds.remove(&fd);
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel all waiters on `fd` with CLOSED and close the descriptor
    pub(crate) fn close(&self, fd: RawFd) {
        let (read, write) = {
            let mut fds = self.fds.lock();
            match fds.remove(&fd) {
                Some(mut record) => {
                    if record.registered != 0 {
                        unsafe {
                            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                        }
                        record.registered = 0;
                    }
                    (record.read, record.write)
                }
                None => (None, None),
            }
        };

        for waiter in [read, write].into_iter().flatten() {
            waiter.outcome.store(IO_CLOSED, Ordering::Release);
            scheduler::ready(waiter.fiber.clone());
        }

        unsafe {
            libc::close(fd);
        }
    }

    /// Reconcile this fd's epoll registration with its occupied slots
    ///
    /// Caller holds the table lock.
    fn sync_epoll(&self, fd: RawFd, record: &mut FdRecord) -> WeftResult<()> {
        let wanted = record.wanted_events();
        if wanted == record.registered {
            return Ok(());
        }

        let op = if record.registered == 0 {
            libc::EPOLL_CTL_ADD
        } else if wanted == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };

        let mut event = libc::epoll_event {
            events: wanted,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret != 0 {
            return Err(WeftError::Io(last_errno()));
        }
        record.registered = wanted;
        Ok(())
    }

    /// One blocking poll; wakes every waiter whose readiness arrived
    ///
    /// Driver-only.
    pub(crate) fn poll(&self, timeout_ms: i32) {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };

        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let errno = last_errno();
            if errno != libc::EINTR {
                log::error!("epoll_wait failed (errno {})", errno);
            }
            return;
        }

        let mut woken: Vec<Arc<IoWaiter>> = Vec::new();
        {
            let mut fds = self.fds.lock();
            for event in events.iter().take(n as usize) {
                let fd = event.u64 as RawFd;
                let revents = event.events;
                let record = match fds.get_mut(&fd) {
                    Some(r) => r,
                    None => continue,
                };

                let error = revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                if error || revents & libc::EPOLLIN as u32 != 0 {
                    if let Some(waiter) = record.read.take() {
                        woken.push(waiter);
                    }
                }
                if error || revents & libc::EPOLLOUT as u32 != 0 {
                    if let Some(waiter) = record.write.take() {
                        woken.push(waiter);
                    }
                }
                let _ = self.sync_epoll(fd, record);
                if record.read.is_none() && record.write.is_none() {
                    fds.remove(&fd);
                }
            }
        }

        for waiter in woken {
            waiter.outcome.store(IO_READY, Ordering::Release);
            scheduler::ready(waiter.fiber.clone());
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
