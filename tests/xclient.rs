use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

mod support;

use xrpc::client::{
    ClientOption, FailMode, KVPair, MultipleServersDiscovery, Peer2PeerDiscovery, SelectMode, Selector,
    ServerSet, ServiceDiscovery, XClient,
};
use xrpc::codec::{Codec, Codecs};
use xrpc::protocol::{self, SerializeType};
use xrpc::server::{self, method_fn, Server, ServerOption, Service};
use xrpc::{Context, Error};

use support::{arith, failing, replying, serve, serve_with, Args, WAIT};

/// `Arith.Mul` failing its first `failures` calls, then multiplying.
fn flaky(failures: usize) -> (Service, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let service = Service::new("Arith").method(
        "Mul",
        method_fn(move |_ctx, args: Args| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    anyhow::bail!("transient failure {n}");
                }
                Ok(args.a * args.b)
            }
        }),
    );
    (service, calls)
}

/// Bare frame server answering every request with `value`. Counts accepted
/// connections and reports each one the client closed.
struct Counting {
    key: String,
    accepted: Arc<AtomicUsize>,
    closed: mpsc::UnboundedReceiver<()>,
}

async fn counting(value: i64) -> Counting {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let key = format!("tcp@{}", listener.local_addr().expect("local address"));
    let accepted = Arc::new(AtomicUsize::new(0));
    let (closed_tx, closed) = mpsc::unbounded_channel();

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                while let Ok(req) = protocol::read_message(&mut stream).await {
                    let mut resp = req.reply();
                    resp.payload = Codec::MsgPack.encode(&value).expect("encode reply");
                    if protocol::write_message(&mut stream, &resp, None).await.is_err() {
                        break;
                    }
                }
                let _ = closed_tx.send(());
            });
        }
    });
    Counting { key, accepted, closed }
}

/// Always picks the greatest server key.
struct Last;

impl Selector for Last {
    fn select(&self, _ctx: &Context, servers: &ServerSet) -> Option<String> {
        servers.keys().next_back().cloned()
    }
}

fn xclient(fail_mode: FailMode, discovery: Arc<dyn ServiceDiscovery>, option: ClientOption) -> XClient {
    XClient::new("Arith", fail_mode, SelectMode::RoundRobin, discovery, option)
}

fn pairs(keys: &[&str]) -> Vec<KVPair> {
    keys.iter().map(|k| KVPair::new(*k, "")).collect()
}

async fn mul(xclient: &XClient) -> xrpc::Result<i64> {
    timeout(WAIT, xclient.call(&Context::background(), "Mul", &Args { a: 10, b: 20 }))
        .await
        .expect("reply in time")
}

#[tokio::test]
async fn failfast_returns_the_first_error() {
    let (service, calls) = flaky(1);
    let (_server, key) = serve("tcp", service).await;
    let xclient = xclient(FailMode::Failfast, Arc::new(Peer2PeerDiscovery::new(key, "")), ClientOption::default());

    assert!(matches!(mul(&xclient).await, Err(Error::Service(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mul(&xclient).await.expect("second call"), 200);
}

#[tokio::test]
async fn failtry_retries_the_same_server_until_success() {
    support::init_tracing();
    let (service, calls) = flaky(2);
    let (_server, key) = serve("tcp", service).await;
    let xclient = xclient(
        FailMode::Failtry,
        Arc::new(Peer2PeerDiscovery::new(key, "")),
        ClientOption::default().with_retries(3),
    );

    assert_eq!(mul(&xclient).await.expect("third attempt succeeds"), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failtry_returns_the_last_error_when_retries_run_out() {
    let (service, calls) = flaky(10);
    let (_server, key) = serve("tcp", service).await;
    let xclient = xclient(
        FailMode::Failtry,
        Arc::new(Peer2PeerDiscovery::new(key, "")),
        ClientOption::default().with_retries(2),
    );

    match mul(&xclient).await {
        Err(Error::Service(msg)) => assert_eq!(msg, "transient failure 1"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failover_moves_to_a_healthy_server() {
    let (_bad, bad_key) = serve("tcp", failing("always broken")).await;
    let (_good, good_key) = serve("tcp", arith()).await;
    let discovery = Arc::new(MultipleServersDiscovery::new(pairs(&[&bad_key, &good_key])));
    let xclient = xclient(FailMode::Failover, discovery, ClientOption::default().with_retries(3));

    for _ in 0..4 {
        assert_eq!(mul(&xclient).await.expect("served by the healthy server"), 200);
    }
}

#[tokio::test]
async fn failover_skips_unreachable_servers() {
    // nothing listens on the discard port of the loopback interface
    let (_good, good_key) = serve("tcp", arith()).await;
    let discovery = Arc::new(MultipleServersDiscovery::new(pairs(&["tcp@127.0.0.1:9", &good_key])));
    let xclient = xclient(FailMode::Failover, discovery, ClientOption::default().with_retries(2));

    for _ in 0..2 {
        assert_eq!(mul(&xclient).await.expect("served by the reachable server"), 200);
    }
}

#[tokio::test]
async fn no_eligible_server_is_reported_without_retry() {
    let discovery = Arc::new(MultipleServersDiscovery::new(vec![KVPair::new("tcp@127.0.0.1:9", "state=inactive")]));
    let xclient = xclient(FailMode::Failover, discovery, ClientOption::default());

    assert!(xclient.servers().is_empty());
    assert!(matches!(mul(&xclient).await, Err(Error::NoServer)));
    let res: xrpc::Result<i64> = xclient.broadcast(&Context::background(), "Mul", &Args::default()).await;
    assert!(matches!(res, Err(Error::NoServer)));
    let res: xrpc::Result<i64> = xclient.fork(&Context::background(), "Mul", &Args::default()).await;
    assert!(matches!(res, Err(Error::NoServer)));
}

#[tokio::test]
async fn go_returns_an_in_flight_call() {
    let (_server, key) = serve("tcp", arith()).await;
    let xclient = xclient(FailMode::Failfast, Arc::new(Peer2PeerDiscovery::new(key, "")), ClientOption::default());

    let call = xclient
        .go::<Args, i64>(&Context::background(), "Mul", &Args { a: 3, b: 7 })
        .await
        .expect("sent");
    assert_eq!(call.service_path(), "Arith");
    assert_eq!(call.service_method(), "Mul");
    assert_eq!(timeout(WAIT, call).await.expect("reply in time").expect("reply"), 21);
}

#[tokio::test]
async fn broadcast_succeeds_only_when_every_server_does() {
    let (_a, a) = serve("tcp", arith()).await;
    let (_b, b) = serve("tcp", arith()).await;
    let (_c, c) = serve("tcp", arith()).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&a, &b, &c]))),
        ClientOption::default(),
    );

    let reply: i64 = timeout(WAIT, xclient.broadcast(&Context::background(), "Mul", &Args { a: 10, b: 20 }))
        .await
        .expect("broadcast in time")
        .expect("all servers succeed");
    assert_eq!(reply, 200);
}

#[tokio::test]
async fn broadcast_reports_one_failing_server() {
    let (_a, a) = serve("tcp", arith()).await;
    let (_b, b) = serve("tcp", failing("server b is down")).await;
    let (_c, c) = serve("tcp", arith()).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&a, &b, &c]))),
        ClientOption::default(),
    );

    let res: xrpc::Result<i64> = timeout(WAIT, xclient.broadcast(&Context::background(), "Mul", &Args::default()))
        .await
        .expect("broadcast in time");
    match res {
        Err(Error::Service(msg)) => assert_eq!(msg, "server b is down"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_is_bounded_by_the_fan_out_timeout() {
    let (_a, a) = serve("tcp", replying(1, Duration::ZERO)).await;
    let (_b, b) = serve("tcp", replying(2, Duration::from_secs(3))).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&a, &b]))),
        ClientOption::default().with_fan_out_timeout(Duration::from_millis(200)),
    );

    let res: xrpc::Result<i64> = timeout(WAIT, xclient.broadcast(&Context::background(), "Mul", &Args::default()))
        .await
        .expect("broadcast gives up in time");
    assert!(matches!(res, Err(Error::Timeout)), "{res:?}");
}

#[tokio::test]
async fn fork_returns_the_first_success() {
    let (_slow, slow) = serve("tcp", replying(1, Duration::from_secs(2))).await;
    let (_broken, broken) = serve("tcp", failing("broken")).await;
    let (_fast, fast) = serve("tcp", replying(2, Duration::from_millis(50))).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&slow, &broken, &fast]))),
        ClientOption::default(),
    );

    let started = tokio::time::Instant::now();
    let reply: i64 = timeout(WAIT, xclient.fork(&Context::background(), "Mul", &Args::default()))
        .await
        .expect("fork in time")
        .expect("one server succeeds");
    assert_eq!(reply, 2);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn fork_returns_an_error_when_every_server_fails() {
    let (_a, a) = serve("tcp", failing("broken")).await;
    let (_b, b) = serve("tcp", failing("broken")).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&a, &b]))),
        ClientOption::default(),
    );

    let res: xrpc::Result<i64> = timeout(WAIT, xclient.fork(&Context::background(), "Mul", &Args::default()))
        .await
        .expect("fork in time");
    match res {
        Err(Error::Service(msg)) => assert_eq!(msg, "broken"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn server_set_follows_discovery_updates() {
    let (_a, a) = serve("tcp", replying(1, Duration::ZERO)).await;
    let (_b, b) = serve("tcp", replying(2, Duration::ZERO)).await;
    let discovery = Arc::new(MultipleServersDiscovery::new(pairs(&[&a])));
    let xclient = xclient(FailMode::Failfast, discovery.clone(), ClientOption::default());
    assert_eq!(mul(&xclient).await.expect("served by a"), 1);

    discovery.update(pairs(&[&b])).await;
    timeout(WAIT, async {
        while !xclient.servers().contains_key(&b) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("update observed");
    assert_eq!(xclient.servers().len(), 1);
    assert_eq!(mul(&xclient).await.expect("served by b"), 2);
}

#[tokio::test]
async fn group_option_filters_discovered_servers() {
    let discovery = Arc::new(MultipleServersDiscovery::new(vec![
        KVPair::new("tcp@127.0.0.1:1", "group=blue"),
        KVPair::new("tcp@127.0.0.1:2", "group=green"),
        KVPair::new("tcp@127.0.0.1:3", "group=blue&state=inactive"),
    ]));
    let xclient = xclient(FailMode::Failfast, discovery.clone(), ClientOption::default().with_group("blue"));
    assert_eq!(xclient.servers().keys().cloned().collect::<Vec<_>>(), vec!["tcp@127.0.0.1:1"]);

    discovery
        .update(vec![KVPair::new("tcp@127.0.0.1:4", "group=blue"), KVPair::new("tcp@127.0.0.1:5", "")])
        .await;
    timeout(WAIT, async {
        while !xclient.servers().contains_key("tcp@127.0.0.1:4") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("update observed");
    assert_eq!(xclient.servers().len(), 1);
}

#[tokio::test]
async fn close_rejects_later_calls() {
    let (_server, key) = serve("tcp", arith()).await;
    let xclient = xclient(FailMode::Failtry, Arc::new(Peer2PeerDiscovery::new(key, "")), ClientOption::default());
    assert_eq!(mul(&xclient).await.expect("mul"), 200);

    xclient.close().await.expect("close");
    assert!(matches!(mul(&xclient).await, Err(Error::Shutdown)));
    let res = xclient.go::<Args, i64>(&Context::background(), "Mul", &Args::default()).await;
    assert!(matches!(res, Err(Error::Shutdown)));
}

#[tokio::test]
async fn connections_to_removed_servers_are_closed() {
    let mut old = counting(1).await;
    let new = counting(2).await;
    let discovery = Arc::new(MultipleServersDiscovery::new(pairs(&[&old.key])));
    let xclient = xclient(FailMode::Failfast, discovery.clone(), ClientOption::default());
    assert_eq!(mul(&xclient).await.expect("served by the old server"), 1);

    discovery.update(pairs(&[&new.key])).await;
    timeout(WAIT, old.closed.recv()).await.expect("old connection closed in time").expect("closed signal");
    assert_eq!(mul(&xclient).await.expect("served by the new server"), 2);
    assert_eq!(new.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_cached_connection_is_redialed() {
    let option = ServerOption::default().with_read_timeout(Duration::from_millis(100));
    let (_server, key) = serve_with("tcp", option, arith()).await;
    let xclient = xclient(FailMode::Failfast, Arc::new(Peer2PeerDiscovery::new(key, "")), ClientOption::default());
    assert_eq!(mul(&xclient).await.expect("first connection"), 200);

    // the server drops the idle connection
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(mul(&xclient).await.expect("fresh connection"), 200);
}

#[tokio::test]
async fn concurrent_first_calls_share_one_connection() {
    let server = counting(7).await;
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(Peer2PeerDiscovery::new(server.key.clone(), "")),
        ClientOption::default(),
    );

    let replies = join_all((0..8).map(|_| mul(&xclient))).await;
    for reply in replies {
        assert_eq!(reply.expect("reply"), 7);
    }
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn custom_selector_decides_the_server() {
    let (_a, a) = serve("tcp", replying(1, Duration::ZERO)).await;
    let (_b, b) = serve("tcp", replying(2, Duration::ZERO)).await;
    let expected = if a > b { 1 } else { 2 };
    let xclient = xclient(
        FailMode::Failfast,
        Arc::new(MultipleServersDiscovery::new(pairs(&[&a, &b]))),
        ClientOption::default(),
    )
    .with_selector(Box::new(Last));

    for _ in 0..3 {
        assert_eq!(mul(&xclient).await.expect("mul"), expected);
    }
}

#[tokio::test]
async fn custom_codecs_reach_new_connections() {
    let codecs = Arc::new(Codecs::default().register(SerializeType::Thrift, Codec::Json));
    let server = Server::with_codecs(ServerOption::default(), codecs.clone());
    server.register(arith()).expect("register");
    let listener = server::listen("tcp", "127.0.0.1:0").await.expect("bind");
    let key = format!("tcp@{}", listener.local_addr().expect("local address"));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_listener("tcp", listener).await });

    let option = ClientOption::default().with_serialize_type(SerializeType::Thrift);
    let discovery: Arc<dyn ServiceDiscovery> = Arc::new(Peer2PeerDiscovery::new(key, ""));

    let plain = xclient(FailMode::Failfast, discovery.clone(), option.clone());
    assert!(matches!(mul(&plain).await, Err(Error::UnsupportedCodec(SerializeType::Thrift))));

    let custom = xclient(FailMode::Failfast, discovery, option).with_codecs(codecs);
    assert_eq!(mul(&custom).await.expect("thrift-tagged json"), 200);
    server.close();
}
