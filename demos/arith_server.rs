use serde::{Deserialize, Serialize};
use xrpc::server::{method_fn, Server, ServerOption, Service};

/// Address the arithmetic service listens on
const ADDR: &str = "127.0.0.1:8972";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

/// Demo server exposing an `Arith` service with `Mul` and `Div`.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let server = Server::new(ServerOption::default());
    let arith = Service::new("Arith")
        .method("Mul", method_fn(|_ctx, args: Args| async move { Ok::<_, anyhow::Error>(args.a * args.b) }))
        .method(
            "Div",
            method_fn(|_ctx, args: Args| async move {
                if args.b == 0 {
                    anyhow::bail!("divide by zero");
                }
                Ok(args.a / args.b)
            }),
        );
    server.register(arith).unwrap();

    println!("Starting Arith server on tcp@{ADDR}");
    server.serve("tcp", ADDR).await.unwrap();
}
