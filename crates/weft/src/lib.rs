//! # weft
//!
//! A cooperatively-scheduled fiber runtime (M:N lightweight tasks on a
//! worker-thread pool) with event-driven non-blocking I/O, a hashed
//! timing wheel, fiber-aware synchronization primitives, and a framed
//! RPC layer built on top of them.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{block_on, go, sleep_ms, Channel};
//!
//! fn main() {
//!     block_on(|| {
//!         let ch: Channel<u32> = Channel::new(4);
//!
//!         let tx = ch.clone();
//!         go(move || {
//!             for i in 0..5 {
//!                 tx.send(i).unwrap();
//!             }
//!         });
//!
//!         for _ in 0..5 {
//!             println!("got {}", ch.recv().unwrap());
//!         }
//!     });
//! }
//! ```
//!
//! ## RPC
//!
//! ```ignore
//! use weft::rpc::{RpcClient, RpcServer};
//! use weft::wire_record;
//!
//! #[derive(Debug, Clone, PartialEq, Default)]
//! struct EchoArgs { message: String, id: u64 }
//! wire_record!(EchoArgs { message, id });
//!
//! weft::block_on(|| {
//!     let server = RpcServer::new();
//!     server.register("echo", |input: &EchoArgs, output: &mut EchoArgs| {
//!         *output = input.clone();
//!         None
//!     });
//!     let port = server.start(0).unwrap();
//!
//!     let client = RpcClient::new();
//!     client.connect("127.0.0.1", port, 3000).unwrap();
//!     let mut reply = EchoArgs::default();
//!     client.call("echo", &EchoArgs { message: "hi".into(), id: 1 }, &mut reply, 5000).unwrap();
//! });
//! ```

// Re-export core types
pub use weft_core::{
    FiberId, FiberState, TryRecvError, TrySendError, WeftError, WeftResult,
};

// Re-export the runtime surface
pub use weft_runtime::{
    block_on, current, is_in_fiber, resume, runtime, sleep, sleep_ms, yield_now, Channel,
    ExitDisposition, Fiber, FiberCondition, FiberMutex, FiberMutexGuard, Runtime, RuntimeConfig,
    WaitGroup, WaitQueue,
};

/// Fiber-blocking I/O on raw fds
pub use weft_runtime::io;

/// The RPC layer
pub mod rpc {
    pub use weft_rpc::{
        ByteBuffer, Connection, Decoder, Encoder, MemoryPersister, Persister, RpcClient,
        RpcRequest, RpcResponse, RpcServer, ServiceInstance, ServiceRegistry, StaticRegistry,
        WatchCallback, Wire, WireReader, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    };
}

pub use weft_rpc::wire_record;

/// Spawn a fiber onto the process-wide runtime
///
/// The runtime starts on first use. Panics if the runtime is shutting
/// down; use `Runtime::spawn` for a fallible variant.
pub fn go<F>(f: F) -> FiberId
where
    F: FnOnce() + Send + 'static,
{
    weft_runtime::spawn(f).expect("runtime is shutting down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_go_style_spawn() {
        block_on(|| {
            let wg = Arc::new(WaitGroup::new());
            let hits = Arc::new(AtomicUsize::new(0));
            wg.add(3).unwrap();

            for _ in 0..3 {
                let wg = wg.clone();
                let hits = hits.clone();
                go(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    wg.done().unwrap();
                });
            }

            wg.wait();
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn test_block_on_returns_value() {
        let answer = block_on(|| 41 + 1);
        assert_eq!(answer, 42);
    }
}
