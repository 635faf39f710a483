use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xrpc::client::{ClientOption, FailMode, Peer2PeerDiscovery, SelectMode, XClient};
use xrpc::Context;

/// Server started by the `arith_server` demo
const SERVER: &str = "tcp@127.0.0.1:8972";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

/// Demo client calling the `Arith` service once per second.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let discovery = Arc::new(Peer2PeerDiscovery::new(SERVER, ""));
    let xclient = XClient::new("Arith", FailMode::Failtry, SelectMode::RandomSelect, discovery, ClientOption::default());

    for b in (0..5).rev() {
        let args = Args { a: 10, b };
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let product: xrpc::Result<i64> = xclient.call(&ctx, "Mul", &args).await;
        println!("{} * {} = {:?}", args.a, args.b, product);

        let quotient: xrpc::Result<i64> = xclient.call(&ctx, "Div", &args).await;
        println!("{} / {} = {:?}", args.a, args.b, quotient);

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    xclient.close().await.unwrap();
}
