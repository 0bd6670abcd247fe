//! Fiber-blocking I/O wrappers
//!
//! Each operation attempts the syscall non-blocking; on EAGAIN the fiber
//! registers in the fd's waiter slot, arms a timeout timer, and parks.
//! The driver wakes it on readiness, the wheel on timeout, the closer on
//! close; whichever takes the waiter first wins.
//!
//! Timeouts are in milliseconds; -1 means wait forever.

use crate::poller::{Interest, IoWaiter, IO_CLOSED, IO_READY, IO_TIMED_OUT};
use crate::stack::last_errno;
use crate::{scheduler, tls};
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::time::Instant;
use weft_core::{WeftError, WeftResult};

fn set_nonblocking(fd: RawFd) -> WeftResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(WeftError::Io(last_errno()));
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(WeftError::Io(last_errno()));
    }
    Ok(())
}

/// Park the current fiber until `fd` is ready in `interest` direction
///
/// Returns `Ok` on readiness, `Timeout` when the deadline fired first,
/// `Closed` when the fd was closed underneath the waiter, `Busy` when
/// another fiber already occupies the slot.
fn wait_ready(fd: RawFd, interest: Interest, timeout_ms: i64) -> WeftResult<()> {
    let fiber = tls::current()
        .ok_or(WeftError::Invariant("blocking io outside a fiber"))?;

    let runtime = crate::runtime::runtime();
    let waiter = IoWaiter::new(fiber.clone());
    runtime.poller().register(fd, interest, waiter.clone())?;

    let timer = if timeout_ms >= 0 {
        let w = waiter.clone();
        let handle = runtime.wheel().add(
            timeout_ms,
            move || {
                if crate::runtime::runtime().poller().retract(fd, interest, &w) {
                    w.outcome.store(IO_TIMED_OUT, Ordering::Release);
                    scheduler::ready(w.fiber.clone());
                }
            },
            false,
        );
        match handle {
            Ok(h) => Some(h),
            Err(e) => {
                // Roll the registration back. If readiness already
                // claimed the waiter, a wake is in flight: park once to
                // consume it instead of leaking a stale notification.
                if !runtime.poller().retract(fd, interest, &waiter) {
                    scheduler::park_current();
                }
                return Err(e);
            }
        }
    } else {
        None
    };

    scheduler::park_current();

    if let Some(handle) = timer {
        runtime.wheel().cancel(&handle);
    }

    match waiter.outcome() {
        IO_READY => Ok(()),
        IO_TIMED_OUT => Err(WeftError::Timeout),
        IO_CLOSED => Err(WeftError::Closed),
        _ => Err(WeftError::Invariant("io waiter woke without an outcome")),
    }
}

/// Remaining budget of a deadline, or `Timeout` once it is spent
fn remaining_ms(deadline: Option<Instant>) -> WeftResult<i64> {
    match deadline {
        None => Ok(-1),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(WeftError::Timeout)
            } else {
                Ok((d - now).as_millis() as i64 + 1)
            }
        }
    }
}

fn deadline_for(timeout_ms: i64) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + std::time::Duration::from_millis(timeout_ms as u64))
    }
}

/// Read up to `buf.len()` bytes; 0 means EOF
pub fn read(fd: RawFd, buf: &mut [u8], timeout_ms: i64) -> WeftResult<usize> {
    set_nonblocking(fd)?;
    let deadline = deadline_for(timeout_ms);
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = last_errno();
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
            return Err(WeftError::Io(errno));
        }
        wait_ready(fd, Interest::Read, remaining_ms(deadline)?)?;
    }
}

/// Write up to `buf.len()` bytes; may be short, callers loop
pub fn write(fd: RawFd, buf: &[u8], timeout_ms: i64) -> WeftResult<usize> {
    set_nonblocking(fd)?;
    let deadline = deadline_for(timeout_ms);
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = last_errno();
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
            return Err(WeftError::Io(errno));
        }
        wait_ready(fd, Interest::Write, remaining_ms(deadline)?)?;
    }
}

/// Write the whole buffer or fail
pub fn write_all(fd: RawFd, mut buf: &[u8], timeout_ms: i64) -> WeftResult<()> {
    let deadline = deadline_for(timeout_ms);
    while !buf.is_empty() {
        let n = write(fd, buf, remaining_ms(deadline)?)?;
        buf = &buf[n..];
    }
    Ok(())
}

/// Accept one connection; the returned fd is already non-blocking
pub fn accept(fd: RawFd, timeout_ms: i64) -> WeftResult<RawFd> {
    set_nonblocking(fd)?;
    let deadline = deadline_for(timeout_ms);
    loop {
        let client = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client >= 0 {
            set_nonblocking(client)?;
            return Ok(client);
        }
        let errno = last_errno();
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
            return Err(WeftError::Io(errno));
        }
        wait_ready(fd, Interest::Read, remaining_ms(deadline)?)?;
    }
}

/// Finish a non-blocking connect on an already-prepared socket
fn finish_connect(fd: RawFd, timeout_ms: i64) -> WeftResult<()> {
    wait_ready(fd, Interest::Write, timeout_ms)?;

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(WeftError::Io(last_errno()));
    }
    if err != 0 {
        return Err(WeftError::Io(err));
    }
    Ok(())
}

/// Close an fd, waking any waiter on it with CLOSED
pub fn close(fd: RawFd) {
    crate::runtime::runtime().poller().close(fd);
}

/// Bind and listen on an IPv4 TCP port
///
/// Port 0 picks an ephemeral port; the actual port is returned with the
/// fd. SO_REUSEADDR is always set.
pub fn listen_tcp(port: u16) -> WeftResult<(RawFd, u16)> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(WeftError::Io(last_errno()));
    }

    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(WeftError::Io(errno));
    }

    if unsafe { libc::listen(fd, 128) } < 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(WeftError::Io(errno));
    }

    // Recover the ephemeral port for port-0 binds
    let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(WeftError::Io(errno));
    }

    Ok((fd, u16::from_be(bound.sin_port)))
}

/// Connect to an IPv4 host with a timeout
pub fn connect_tcp(host: &str, port: u16, timeout_ms: i64) -> WeftResult<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(WeftError::Io(last_errno()));
    }
    if let Err(e) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    let ipv4: std::net::Ipv4Addr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => {
            unsafe { libc::close(fd) };
            return Err(WeftError::Config("host is not a valid IPv4 address"));
        }
    };
    addr.sin_addr.s_addr = u32::from_ne_bytes(ipv4.octets());

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(fd);
    }

    let errno = last_errno();
    if errno != libc::EINPROGRESS {
        unsafe { libc::close(fd) };
        return Err(WeftError::Io(errno));
    }

    match finish_connect(fd, timeout_ms) {
        Ok(()) => Ok(fd),
        Err(e) => {
            close(fd);
            Err(e)
        }
    }
}

/// Half-close then fully close, so a fiber parked in `read` observes the
/// shutdown promptly
pub fn shutdown_and_close(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
    close(fd);
}
