//! # weft-rpc
//!
//! Framed RPC on top of the weft fiber runtime: length-prefixed
//! transport, a positional binary codec, correlation of concurrent
//! calls, and typed server method dispatch.
//!
//! ## Layout
//!
//! - `buffer` - accumulating receive buffer
//! - `frame` - u32-length-prefixed framing
//! - `codec` - structural encoder/decoder and the `wire_record!` macro
//! - `message` - request/response wire types
//! - `connection` - one framed TCP connection
//! - `client` - pending-call table and typed `call`
//! - `server` - method registry, per-request handler fibers
//! - `registry` - service discovery interface + static impl
//! - `persister` - blob persistence interface + in-memory impl

pub mod buffer;
pub mod client;
pub mod codec;
pub mod connection;
pub mod frame;
pub mod message;
pub mod persister;
pub mod registry;
pub mod server;

// The `wire_record!` expansion names these through `$crate`
pub use weft_core::{WeftError, WeftResult};

pub use buffer::ByteBuffer;
pub use client::{RpcClient, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS};
pub use codec::{Decoder, Encoder, Wire, WireReader};
pub use connection::Connection;
pub use message::{RpcRequest, RpcResponse};
pub use persister::{MemoryPersister, Persister};
pub use registry::{ServiceInstance, ServiceRegistry, StaticRegistry, WatchCallback};
pub use server::RpcServer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_record;
    use std::sync::Arc;
    use weft_core::WeftError;
    use weft_runtime::sync::{Channel, WaitGroup};
    use weft_runtime::{block_on, sleep_ms, spawn};

    #[derive(Debug, Clone, PartialEq, Default)]
    struct EchoArgs {
        message: String,
        id: u64,
    }
    wire_record!(EchoArgs { message, id });

    #[derive(Debug, Clone, PartialEq, Default)]
    struct DivideArgs {
        dividend: i32,
        divisor: i32,
    }
    wire_record!(DivideArgs { dividend, divisor });

    #[derive(Debug, Clone, PartialEq, Default)]
    struct DivideReply {
        quotient: i32,
        remainder: i32,
    }
    wire_record!(DivideReply {
        quotient,
        remainder
    });

    fn echo(input: &EchoArgs, output: &mut EchoArgs) -> Option<String> {
        *output = input.clone();
        None
    }

    fn divide(input: &DivideArgs, output: &mut DivideReply) -> Option<String> {
        if input.divisor == 0 {
            return Some("Division by zero".to_string());
        }
        output.quotient = input.dividend / input.divisor;
        output.remainder = input.dividend % input.divisor;
        None
    }

    fn start_test_server() -> (RpcServer, u16) {
        let server = RpcServer::new();
        server.register("echo", echo);
        server.register("divide", divide);
        server.register("panicky", |_input: &u32, _output: &mut u32| -> Option<String> {
            panic!("handler exploded")
        });
        server.register(
            "slow_echo",
            |input: &EchoArgs, output: &mut EchoArgs| -> Option<String> {
                sleep_ms(100);
                *output = input.clone();
                None
            },
        );
        let port = server.start(0).unwrap();
        (server, port)
    }

    #[test]
    fn test_echo_roundtrip() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            let input = EchoArgs {
                message: "Hello, RPC!".to_string(),
                id: 123,
            };
            let mut output = EchoArgs::default();
            client.call("echo", &input, &mut output, 5000).unwrap();

            assert_eq!(output, input);
            assert_eq!(client.pending_calls(), 0);

            client.disconnect();
            server.shutdown();
        });
    }

    #[test]
    fn test_divide_and_application_error() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            let mut reply = DivideReply::default();
            client
                .call(
                    "divide",
                    &DivideArgs {
                        dividend: 17,
                        divisor: 5,
                    },
                    &mut reply,
                    5000,
                )
                .unwrap();
            assert_eq!(
                reply,
                DivideReply {
                    quotient: 3,
                    remainder: 2
                }
            );

            let err = client
                .call(
                    "divide",
                    &DivideArgs {
                        dividend: 10,
                        divisor: 0,
                    },
                    &mut reply,
                    5000,
                )
                .unwrap_err();
            match err {
                WeftError::Application(message) => assert!(!message.is_empty()),
                other => panic!("expected application error, got {:?}", other),
            }

            client.disconnect();
            server.shutdown();
        });
    }

    #[test]
    fn test_unknown_method() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            let mut output = EchoArgs::default();
            let err = client
                .call("no_such_method", &EchoArgs::default(), &mut output, 5000)
                .unwrap_err();
            match err {
                WeftError::Application(message) => {
                    assert!(message.contains("method not found"))
                }
                other => panic!("expected application error, got {:?}", other),
            }

            client.disconnect();
            server.shutdown();
        });
    }

    #[test]
    fn test_handler_panic_becomes_application_error() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            let mut output = 0u32;
            let err = client.call("panicky", &1u32, &mut output, 5000).unwrap_err();
            match err {
                WeftError::Application(message) => assert!(message.contains("panicked")),
                other => panic!("expected application error, got {:?}", other),
            }

            // The connection survived the panic
            let input = EchoArgs {
                message: "still here".to_string(),
                id: 1,
            };
            let mut echoed = EchoArgs::default();
            client.call("echo", &input, &mut echoed, 5000).unwrap();
            assert_eq!(echoed, input);

            client.disconnect();
            server.shutdown();
        });
    }

    // Five clients, three calls each; every reply must round-trip to
    // the client that asked for it
    #[test]
    fn test_concurrent_clients() {
        block_on(|| {
            let (server, port) = start_test_server();
            let wg = Arc::new(WaitGroup::new());
            let failures: Channel<String> = Channel::new(64);

            wg.add(5).unwrap();
            for client_id in 0..5u64 {
                let wg = wg.clone();
                let failures = failures.clone();
                spawn(move || {
                    let client = RpcClient::new();
                    if let Err(e) = client.connect("127.0.0.1", port, 3000) {
                        let _ = failures.try_send(format!("connect: {}", e));
                        wg.done().unwrap();
                        return;
                    }

                    for request_num in 0..3u64 {
                        let input = EchoArgs {
                            message: format!("Hello from client {}", client_id),
                            id: client_id * 100 + request_num,
                        };
                        let mut output = EchoArgs::default();
                        match client.call("echo", &input, &mut output, 5000) {
                            Ok(()) if output == input => {}
                            Ok(()) => {
                                let _ = failures
                                    .try_send(format!("wrong payload: {:?}", output));
                            }
                            Err(e) => {
                                let _ = failures.try_send(format!("call: {}", e));
                            }
                        }
                    }

                    assert_eq!(client.pending_calls(), 0);
                    client.disconnect();
                    wg.done().unwrap();
                })
                .unwrap();
            }

            wg.wait();
            if let Ok(failure) = failures.try_recv() {
                panic!("concurrent client failure: {}", failure);
            }

            server.shutdown();
        });
    }

    // Pipelining: a slow handler does not block a later fast request on
    // the same connection
    #[test]
    fn test_pipelined_requests_interleave() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = Arc::new(RpcClient::new());
            client.connect("127.0.0.1", port, 3000).unwrap();

            let order: Channel<&'static str> = Channel::new(2);

            let slow_client = client.clone();
            let slow_order = order.clone();
            spawn(move || {
                let input = EchoArgs {
                    message: "slow".to_string(),
                    id: 1,
                };
                let mut output = EchoArgs::default();
                slow_client
                    .call("slow_echo", &input, &mut output, 5000)
                    .unwrap();
                slow_order.send("slow").unwrap();
            })
            .unwrap();

            sleep_ms(20);
            let input = EchoArgs {
                message: "fast".to_string(),
                id: 2,
            };
            let mut output = EchoArgs::default();
            client.call("echo", &input, &mut output, 5000).unwrap();
            order.send("fast").unwrap();

            assert_eq!(order.recv().unwrap(), "fast");
            assert_eq!(order.recv().unwrap(), "slow");

            client.disconnect();
            server.shutdown();
        });
    }

    #[test]
    fn test_call_timeout_clears_pending() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            let input = EchoArgs {
                message: "too slow".to_string(),
                id: 9,
            };
            let mut output = EchoArgs::default();
            // slow_echo takes ~100 ms; a 30 ms budget must time out
            let err = client
                .call("slow_echo", &input, &mut output, 30)
                .unwrap_err();
            assert_eq!(err, WeftError::Timeout);
            assert_eq!(client.pending_calls(), 0);

            client.disconnect();
            server.shutdown();
        });
    }

    // Disconnect mid-call: the pending table drains and the caller sees
    // DISCONNECTED (Closed), not a hang
    #[test]
    fn test_disconnect_fails_pending_calls() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = Arc::new(RpcClient::new());
            client.connect("127.0.0.1", port, 3000).unwrap();

            let result: Channel<WeftError> = Channel::new(1);
            let caller = client.clone();
            let out = result.clone();
            spawn(move || {
                let input = EchoArgs {
                    message: "doomed".to_string(),
                    id: 5,
                };
                let mut output = EchoArgs::default();
                let err = caller
                    .call("slow_echo", &input, &mut output, 5000)
                    .unwrap_err();
                out.send(err).unwrap();
            })
            .unwrap();

            sleep_ms(30);
            client.disconnect();

            assert_eq!(result.recv().unwrap(), WeftError::Closed);
            assert_eq!(client.pending_calls(), 0);

            server.shutdown();
        });
    }

    #[test]
    fn test_call_without_connect_fails() {
        block_on(|| {
            let client = RpcClient::new();
            let mut output = EchoArgs::default();
            let err = client
                .call("echo", &EchoArgs::default(), &mut output, 1000)
                .unwrap_err();
            assert_eq!(err, WeftError::Closed);
        });
    }

    #[test]
    fn test_server_shutdown_closes_connections() {
        block_on(|| {
            let (server, port) = start_test_server();
            let client = RpcClient::new();
            client.connect("127.0.0.1", port, 3000).unwrap();

            // Make sure the connection is established server-side
            let mut output = EchoArgs::default();
            client
                .call("echo", &EchoArgs::default(), &mut output, 5000)
                .unwrap();
            assert_eq!(server.connection_count(), 1);

            server.shutdown();
            sleep_ms(50);

            let err = client
                .call("echo", &EchoArgs::default(), &mut output, 1000)
                .unwrap_err();
            assert!(matches!(err, WeftError::Closed | WeftError::Io(_)));
        });
    }
}
