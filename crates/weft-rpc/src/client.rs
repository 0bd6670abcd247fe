//! RPC client
//!
//! One TCP connection, one receive-loop fiber, and a pending-call table
//! keyed by request id. Callers park on a single-slot channel installed
//! before the frame goes out; the receive loop routes each response to
//! its channel, so at most one response is ever delivered per id.

use crate::codec::{Decoder, Encoder, Wire};
use crate::connection::Connection;
use crate::message::{RpcRequest, RpcResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use weft_core::{SpinLock, WeftError, WeftResult};
use weft_runtime::sync::Channel;
use weft_runtime::FiberMutex;

/// Default connect timeout (ms)
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 3_000;

/// Default per-call timeout (ms)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;

struct ClientInner {
    conn: SpinLock<Option<Arc<Connection>>>,
    next_request_id: AtomicU64,
    connected: AtomicBool,
    pending: FiberMutex<HashMap<u64, Channel<RpcResponse>>>,
}

impl ClientInner {
    /// Route one decoded response frame to its parked caller
    fn handle_response(&self, payload: Vec<u8>) {
        let response = match RpcResponse::from_payload(&payload) {
            Ok(response) => response,
            Err(e) => {
                log::error!("rpc client: undecodable response dropped: {}", e);
                return;
            }
        };

        let slot = self.pending.lock().remove(&response.request_id);
        match slot {
            Some(channel) => {
                let id = response.request_id;
                log::debug!("rpc client: response for request {}", id);
                // Single-slot channel, single producer: cannot block
                if channel.send(response).is_err() {
                    log::debug!("rpc client: caller for request {} already gone", id);
                }
            }
            None => {
                log::warn!(
                    "rpc client: response for unknown request {} dropped",
                    response.request_id
                );
            }
        }
    }

    /// Fail every outstanding call with DISCONNECTED
    fn drain_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, channel) in drained {
            channel.close();
        }
    }
}

/// A typed RPC client over one connection
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                conn: SpinLock::new(None),
                next_request_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                pending: FiberMutex::new(HashMap::new()),
            }),
        }
    }

    /// Open the TCP connection and start the receive loop
    pub fn connect(&self, host: &str, port: u16, timeout_ms: i64) -> WeftResult<()> {
        if self.inner.connected.load(Ordering::Acquire) {
            log::warn!("rpc client: already connected");
            return Ok(());
        }

        let fd = weft_runtime::io::connect_tcp(host, port, timeout_ms)?;
        let conn = Arc::new(Connection::new(fd));
        *self.inner.conn.lock() = Some(conn.clone());
        self.inner.connected.store(true, Ordering::Release);
        log::info!("rpc client: connected to {}:{} (fd={})", host, port, fd);

        let inner = self.inner.clone();
        weft_runtime::spawn(move || {
            conn.receive_loop(|payload| inner.handle_response(payload));
            // Peer EOF, io error or local close: every waiter learns
            inner.connected.store(false, Ordering::Release);
            inner.drain_pending();
        })?;

        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Call `method` with `input`, decoding the reply into `output`
    ///
    /// Error mapping: `Io` when the send fails, `Timeout` when the
    /// deadline lapses, `Closed` on disconnect, `Application` when the
    /// handler reported failure, `Decode` when the reply blob does not
    /// parse into `O`.
    pub fn call<I, O>(
        &self,
        method: &str,
        input: &I,
        output: &mut O,
        timeout_ms: u64,
    ) -> WeftResult<()>
    where
        I: Wire,
        O: Wire,
    {
        let conn = match &*self.inner.conn.lock() {
            Some(conn) if !conn.is_closed() => conn.clone(),
            _ => return Err(WeftError::Closed),
        };

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);

        let mut params = Encoder::new();
        params.encode(input);
        let request = RpcRequest {
            request_id,
            method: method.to_string(),
            params: params.into_bytes(),
        };

        // Install the reply slot before the frame can possibly be
        // answered
        let reply: Channel<RpcResponse> = Channel::new(1);
        self.inner.pending.lock().insert(request_id, reply.clone());

        log::debug!("rpc client: call {} (request {})", method, request_id);
        if let Err(e) = conn.send(&request.to_payload()) {
            self.inner.pending.lock().remove(&request_id);
            return Err(match e {
                WeftError::Closed => WeftError::Closed,
                other => other,
            });
        }

        let response = match reply.recv_timeout(timeout_ms) {
            Ok(response) => response,
            Err(WeftError::Timeout) => {
                self.inner.pending.lock().remove(&request_id);
                return Err(WeftError::Timeout);
            }
            Err(_) => {
                // Channel closed by drain_pending: disconnected
                return Err(WeftError::Closed);
            }
        };

        if !response.success {
            return Err(WeftError::Application(response.error));
        }

        let mut dec = Decoder::new(&response.result);
        *output = dec.decode()?;
        Ok(())
    }

    /// Call with the default timeout
    pub fn call_default<I, O>(&self, method: &str, input: &I, output: &mut O) -> WeftResult<()>
    where
        I: Wire,
        O: Wire,
    {
        self.call(method, input, output, DEFAULT_CALL_TIMEOUT_MS)
    }

    /// Close the connection and fail every outstanding call
    pub fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let conn = self.inner.conn.lock().take();
        if let Some(conn) = conn {
            conn.close();
        }
        // The receive loop drains too on its way out; draining here as
        // well makes disconnect prompt and is idempotent
        self.inner.drain_pending();
        log::info!("rpc client: disconnected");
    }

    /// Outstanding calls (diagnostics and tests)
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
