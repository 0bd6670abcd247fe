//! RPC server
//!
//! A listener fiber accepts connections; each connection gets a
//! receive-loop fiber; each decoded request is dispatched on a fiber of
//! its own, so a slow handler never blocks pipelining of further
//! requests on the same connection. Correlation is by request id, not
//! arrival order.

use crate::codec::{Decoder, Encoder, Wire};
use crate::connection::Connection;
use crate::message::{RpcRequest, RpcResponse};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use weft_core::{SpinLock, WeftError, WeftResult};
use weft_runtime::io;

/// Internal dispatch shape: params blob in, result blob or error out
type RawHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

struct ServerInner {
    handlers: SpinLock<HashMap<String, Arc<RawHandler>>>,
    listen_fd: AtomicI32,
    running: AtomicBool,
    connections: SpinLock<Vec<Arc<Connection>>>,
}

impl ServerInner {
    /// Decode, dispatch, reply. Runs on a per-request fiber.
    fn dispatch(&self, conn: &Arc<Connection>, payload: Vec<u8>) {
        let request = match RpcRequest::from_payload(&payload) {
            Ok(request) => request,
            Err(e) => {
                // Malformed request: logged and dropped, the connection
                // itself stays up
                log::error!("rpc server: malformed request dropped: {}", e);
                return;
            }
        };

        log::debug!(
            "rpc server: request {} method '{}'",
            request.request_id,
            request.method
        );

        let handler = self.handlers.lock().get(&request.method).cloned();
        let response = match handler {
            None => {
                log::error!("rpc server: method '{}' not found", request.method);
                RpcResponse::fail(
                    request.request_id,
                    format!("method not found: {}", request.method),
                )
            }
            Some(handler) => match handler(&request.params) {
                Ok(result) => RpcResponse::ok(request.request_id, result),
                Err(message) => RpcResponse::fail(request.request_id, message),
            },
        };

        if conn.send(&response.to_payload()).is_err() && !conn.is_closed() {
            log::error!(
                "rpc server: failed to send response for request {}",
                request.request_id
            );
        }
    }

    fn drop_connection(&self, conn: &Arc<Connection>) {
        self.connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, conn));
    }
}

/// A typed RPC server
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handlers: SpinLock::new(HashMap::new()),
                listen_fd: AtomicI32::new(-1),
                running: AtomicBool::new(false),
                connections: SpinLock::new(Vec::new()),
            }),
        }
    }

    /// Register a typed handler for `method`
    ///
    /// The handler fills `output` and returns `None` on success or an
    /// error message. The adaptor decodes the params blob, runs the
    /// handler under `catch_unwind` (a panic becomes an application
    /// error on that request only), and encodes the output.
    pub fn register<I, O, F>(&self, method: &str, handler: F)
    where
        I: Wire,
        O: Wire + Default,
        F: Fn(&I, &mut O) -> Option<String> + Send + Sync + 'static,
    {
        let adaptor: RawHandler = Box::new(move |params: &[u8]| {
            let input: I = Decoder::new(params)
                .decode()
                .map_err(|e| format!("bad request arguments: {}", e))?;
            let mut output = O::default();

            let verdict = panic::catch_unwind(AssertUnwindSafe(|| handler(&input, &mut output)));
            match verdict {
                Ok(None) => {
                    let mut enc = Encoder::new();
                    enc.encode(&output);
                    Ok(enc.into_bytes())
                }
                Ok(Some(message)) => Err(message),
                Err(payload) => {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic payload".to_string());
                    Err(format!("handler panicked: {}", msg))
                }
            }
        });

        self.inner
            .handlers
            .lock()
            .insert(method.to_string(), Arc::new(adaptor));
        log::info!("rpc server: registered method '{}'", method);
    }

    /// Listen on `port` (0 = ephemeral) and start the accept loop
    ///
    /// Returns the actually bound port.
    pub fn start(&self, port: u16) -> WeftResult<u16> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(WeftError::Invariant("server already started"));
        }

        let (listen_fd, bound_port) = match io::listen_tcp(port) {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.inner.listen_fd.store(listen_fd, Ordering::Release);
        log::info!("rpc server: listening on port {}", bound_port);

        let inner = self.inner.clone();
        if let Err(e) = weft_runtime::spawn(move || accept_loop(inner, listen_fd)) {
            self.inner.running.store(false, Ordering::Release);
            self.inner.listen_fd.store(-1, Ordering::Release);
            io::close(listen_fd);
            return Err(e);
        }

        Ok(bound_port)
    }

    /// Close the listener, then close live connections
    ///
    /// The accept loop wakes with CLOSED; connection loops observe their
    /// fd closing and exit.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let listen_fd = self.inner.listen_fd.swap(-1, Ordering::AcqRel);
        if listen_fd >= 0 {
            io::close(listen_fd);
        }

        let connections: Vec<_> = self.inner.connections.lock().drain(..).collect();
        for conn in connections {
            conn.close();
        }
        log::info!("rpc server: shut down");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Live connections (diagnostics and tests)
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(inner: Arc<ServerInner>, listen_fd: RawFd) {
    loop {
        match io::accept(listen_fd, -1) {
            Ok(client_fd) => {
                log::info!("rpc server: accepted connection (fd={})", client_fd);
                let conn = Arc::new(Connection::new(client_fd));
                inner.connections.lock().push(conn.clone());

                let inner = inner.clone();
                let spawned = weft_runtime::spawn(move || {
                    let loop_conn = conn.clone();
                    let loop_inner = inner.clone();
                    loop_conn.receive_loop(|payload| {
                        // Handler fiber per request
                        let conn = conn.clone();
                        let inner = inner.clone();
                        if weft_runtime::spawn(move || inner.dispatch(&conn, payload)).is_err() {
                            log::warn!("rpc server: runtime stopping, request dropped");
                        }
                    });
                    loop_inner.drop_connection(&loop_conn);
                });
                if spawned.is_err() {
                    log::warn!("rpc server: runtime stopping, connection dropped");
                    return;
                }
            }
            Err(WeftError::Closed) => {
                log::debug!("rpc server: listener closed, accept loop exiting");
                return;
            }
            Err(e) => {
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                log::error!("rpc server: accept failed: {}", e);
            }
        }
    }
}
