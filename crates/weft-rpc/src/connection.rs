//! A framed TCP connection
//!
//! Shared between the send-path callers and the receive-loop fiber; the
//! close is idempotent and whoever drops the last `Arc` has already seen
//! the fd closed. Writes hold a fiber mutex so frames produced by
//! concurrent handler fibers never interleave mid-frame.

use crate::buffer::ByteBuffer;
use crate::frame;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use weft_core::{WeftError, WeftResult};
use weft_runtime::io;
use weft_runtime::FiberMutex;

/// Write timeout for one outgoing frame
const SEND_TIMEOUT_MS: i64 = 10_000;

/// Connection lifecycle: NEW -> CONNECTED -> (CLOSING) -> CLOSED. The
/// flag below collapses CLOSING/CLOSED; in-flight writes under the
/// write lock finish before the fd is released.
pub struct Connection {
    fd: RawFd,
    closed: AtomicBool,
    write_lock: FiberMutex<()>,
}

impl Connection {
    /// Adopt an already-connected fd
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            closed: AtomicBool::new(false),
            write_lock: FiberMutex::new(()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frame and send one payload
    ///
    /// A send error tears the connection down and surfaces `Closed` or
    /// the underlying `Io` error.
    pub fn send(&self, payload: &[u8]) -> WeftResult<()> {
        if self.is_closed() {
            return Err(WeftError::Closed);
        }

        let packet = frame::encode(payload);
        let result = {
            let _guard = self.write_lock.lock();
            if self.is_closed() {
                Err(WeftError::Closed)
            } else {
                io::write_all(self.fd, &packet, SEND_TIMEOUT_MS)
            }
        };

        if let Err(e) = &result {
            if !self.is_closed() {
                log::error!("connection fd={} send failed: {}", self.fd, e);
            }
            self.close();
        }
        result
    }

    /// Read frames until EOF, error, or close, invoking `on_frame` for
    /// each complete payload
    ///
    /// Runs on the connection's receive-loop fiber.
    pub fn receive_loop<F: FnMut(Vec<u8>)>(&self, mut on_frame: F) {
        let mut buffer = ByteBuffer::new();
        let mut chunk = [0u8; 4096];

        'conn: while !self.is_closed() {
            let n = match io::read(self.fd, &mut chunk, -1) {
                Ok(0) => {
                    log::info!("connection fd={} closed by peer", self.fd);
                    break;
                }
                Ok(n) => n,
                Err(WeftError::Closed) => break,
                Err(e) => {
                    if !self.is_closed() {
                        log::info!("connection fd={} read failed: {}", self.fd, e);
                    }
                    break;
                }
            };

            buffer.append(&chunk[..n]);

            loop {
                match frame::decode(&mut buffer) {
                    Ok(Some(payload)) => {
                        if self.is_closed() {
                            break 'conn;
                        }
                        on_frame(payload);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Corrupt stream; the connection is unusable
                        log::error!("connection fd={} framing failed: {}", self.fd, e);
                        break 'conn;
                    }
                }
            }
        }

        self.close();
    }

    /// Close the fd, waking any parked reader or writer
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("connection fd={} closed", self.fd);
        io::shutdown_and_close(self.fd);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
