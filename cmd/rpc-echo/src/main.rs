//! RPC echo example
//!
//! Starts an RPC server with `echo` and `divide` methods, connects a
//! client to it, and runs a few calls. Everything happens inside the
//! runtime's entry wrapper.
//!
//! ```bash
//! $ cargo run -p rpc-echo
//! $ RUST_LOG=debug cargo run -p rpc-echo
//! ```

use weft::rpc::{RpcClient, RpcServer};
use weft::wire_record;
use weft::WeftError;

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

fn main() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .unwrap()
        .start()
        .unwrap();

    weft::block_on(|| {
        let server = RpcServer::new();

        server.register("echo", |input: &EchoArgs, output: &mut EchoArgs| {
            *output = input.clone();
            None
        });

        server.register(
            "divide",
            |input: &DivideArgs, output: &mut DivideReply| {
                if input.divisor == 0 {
                    return Some("Division by zero".to_string());
                }
                output.quotient = input.dividend / input.divisor;
                output.remainder = input.dividend % input.divisor;
                None
            },
        );

        let port = server.start(0).expect("failed to start server");
        println!("server listening on 127.0.0.1:{}", port);

        let client = RpcClient::new();
        client
            .connect("127.0.0.1", port, 3000)
            .expect("failed to connect");

        // Echo
        let input = EchoArgs {
            message: "Hello, RPC!".to_string(),
            id: 123,
        };
        let mut echoed = EchoArgs::default();
        client
            .call("echo", &input, &mut echoed, 5000)
            .expect("echo call failed");
        println!("echo({:?}) -> {:?}", input, echoed);

        // Divide
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
            .expect("divide call failed");
        println!("divide(17, 5) -> {:?}", reply);

        // Division by zero surfaces as an application error
        match client.call(
            "divide",
            &DivideArgs {
                dividend: 10,
                divisor: 0,
            },
            &mut reply,
            5000,
        ) {
            Err(WeftError::Application(message)) => {
                println!("divide(10, 0) -> application error: {}", message)
            }
            other => println!("divide(10, 0) -> unexpected: {:?}", other),
        }

        client.disconnect();
        server.shutdown();
    });
}
