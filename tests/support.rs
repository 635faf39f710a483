#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use xrpc::server::{self, method_fn, Context, Method, Server, ServerOption, Service};

/// Upper bound for every wait in the tests.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

struct Panicking;

#[async_trait]
impl Method for Panicking {
    type Args = Args;
    type Reply = i64;

    async fn call(&self, _ctx: &Context, _args: Args) -> anyhow::Result<i64> {
        panic!("handler exploded")
    }
}

/// `Arith` with `Mul`, `Div` (errors on zero), `Sleep` (waits `a` ms, returns
/// `b`), `Panic`, `Peer` (caller address) and `Meta` (the `trace` metadata value).
pub fn arith() -> Service {
    Service::new("Arith")
        .method("Mul", method_fn(|_ctx, args: Args| async move { Ok::<_, anyhow::Error>(args.a * args.b) }))
        .method(
            "Div",
            method_fn(|_ctx, args: Args| async move {
                if args.b == 0 {
                    anyhow::bail!("divide by zero");
                }
                Ok(args.a / args.b)
            }),
        )
        .method(
            "Sleep",
            method_fn(|_ctx, args: Args| async move {
                tokio::time::sleep(Duration::from_millis(args.a as u64)).await;
                Ok::<_, anyhow::Error>(args.b)
            }),
        )
        .method("Panic", Panicking)
        .method(
            "Peer",
            method_fn(|ctx: Context, _args: Args| async move { Ok::<_, anyhow::Error>(ctx.remote_addr().to_string()) }),
        )
        .method(
            "Meta",
            method_fn(|ctx: Context, _args: Args| async move {
                Ok::<_, anyhow::Error>(ctx.metadata().get("trace").cloned().unwrap_or_default())
            }),
        )
}

/// `Arith.Mul` answering `value` after `delay`, whatever the arguments.
pub fn replying(value: i64, delay: Duration) -> Service {
    Service::new("Arith").method(
        "Mul",
        method_fn(move |_ctx, _args: Args| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(value)
        }),
    )
}

/// `Arith.Mul` always failing with `message`.
pub fn failing(message: &'static str) -> Service {
    Service::new("Arith").method(
        "Mul",
        method_fn(move |_ctx, _args: Args| async move { Err::<i64, _>(anyhow::anyhow!(message)) }),
    )
}

/// Serves `service` on a fresh loopback port. Returns the server and its
/// `network@address` key.
pub async fn serve(network: &str, service: Service) -> (Server, String) {
    serve_with(network, ServerOption::default(), service).await
}

pub async fn serve_with(network: &str, option: ServerOption, service: Service) -> (Server, String) {
    let server = Server::new(option);
    server.register(service).expect("register service");
    let listener = server::listen(network, "127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local address");

    let serving = server.clone();
    let network = network.to_string();
    let key = format!("{network}@{addr}");
    tokio::spawn(async move {
        let _ = serving.serve_listener(&network, listener).await;
    });
    (server, key)
}
