use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

mod support;

use xrpc::client::{
    KVPair, KvStore, KvStoreDiscovery, MultipleServersDiscovery, Peer2PeerDiscovery, ServiceDiscovery, WatchConfig,
};

use support::WAIT;

const BASE: &str = "/rpcx/Arith";

/// In-memory registry. The first `failing_watches` watch attempts fail.
#[derive(Default)]
struct MemStore {
    pairs: Mutex<Vec<KVPair>>,
    watchers: Mutex<Vec<mpsc::Sender<Vec<KVPair>>>>,
    failing_watches: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl MemStore {
    fn with(pairs: Vec<KVPair>) -> Self {
        Self { pairs: Mutex::new(pairs), ..Default::default() }
    }

    async fn put(&self, pairs: Vec<KVPair>) {
        *self.pairs.lock().unwrap() = pairs.clone();
        let watchers = self.watchers.lock().unwrap().clone();
        for tx in watchers {
            let _ = tx.send(pairs.clone()).await;
        }
    }

    /// Loses every watch, as a registry session expiry would.
    fn drop_watches(&self) {
        self.watchers.lock().unwrap().clear();
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KVPair>> {
        Ok(self
            .pairs
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn watch_tree(&self, _prefix: &str) -> anyhow::Result<mpsc::Receiver<Vec<KVPair>>> {
        let n = self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failing_watches.load(Ordering::SeqCst) {
            anyhow::bail!("registry unavailable");
        }
        let (tx, rx) = mpsc::channel(10);
        self.watchers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

fn registered(addr: &str, meta: &str) -> KVPair {
    KVPair::new(format!("{BASE}/{addr}"), meta)
}

fn fast_retry(retries: i32) -> WatchConfig {
    WatchConfig {
        retries_after_watch_failed: retries,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        push_timeout: Duration::from_millis(100),
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[test]
fn peer_to_peer_has_one_fixed_server() {
    let discovery = Peer2PeerDiscovery::new("tcp@127.0.0.1:8972", "weight=2");
    assert_eq!(discovery.get_services(), vec![KVPair::new("tcp@127.0.0.1:8972", "weight=2")]);
    assert!(discovery.watch_service().is_none());
}

#[tokio::test]
async fn multiple_servers_pushes_updates_to_watchers() {
    let discovery = MultipleServersDiscovery::new(vec![KVPair::new("tcp@a:1", "")]);
    let mut first = discovery.watch_service().expect("watchable");
    let mut second = discovery.watch_service().expect("watchable");

    let latest = vec![KVPair::new("tcp@b:1", ""), KVPair::new("tcp@c:1", "")];
    discovery.update(latest.clone()).await;

    assert_eq!(discovery.get_services(), latest);
    assert_eq!(timeout(WAIT, first.recv()).await.expect("first in time"), Some(latest.clone()));
    assert_eq!(timeout(WAIT, second.recv()).await.expect("second in time"), Some(latest));
}

#[tokio::test]
async fn slow_watchers_miss_updates_without_blocking_others() {
    let discovery = MultipleServersDiscovery::new(Vec::new()).with_push_timeout(Duration::from_millis(10));
    let mut slow = discovery.watch_service().expect("watchable");
    let dropped = discovery.watch_service().expect("watchable");
    drop(dropped);

    for i in 0..12 {
        let update = vec![KVPair::new(format!("tcp@host:{i}"), "")];
        timeout(WAIT, discovery.update(update)).await.expect("update never blocks for long");
    }

    let mut received = 0;
    while slow.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 10);
    assert_eq!(discovery.get_services(), vec![KVPair::new("tcp@host:11", "")]);
}

#[tokio::test]
async fn kv_store_lists_servers_relative_to_the_base_path() {
    let store = Arc::new(MemStore::with(vec![
        registered("tcp@127.0.0.1:8972", "weight=1"),
        registered("tcp@127.0.0.1:8973", ""),
        KVPair::new("/rpcx/Other/tcp@127.0.0.1:9000", ""),
    ]));
    let discovery = KvStoreDiscovery::new(BASE, store, fast_retry(-1)).await.expect("discovery");

    assert_eq!(
        discovery.get_services(),
        vec![KVPair::new("tcp@127.0.0.1:8972", "weight=1"), KVPair::new("tcp@127.0.0.1:8973", "")]
    );
    discovery.close();
}

#[tokio::test]
async fn kv_store_changes_reach_watchers() {
    let store = Arc::new(MemStore::with(vec![registered("tcp@127.0.0.1:1", "")]));
    let discovery = KvStoreDiscovery::new(BASE, store.clone(), fast_retry(-1)).await.expect("discovery");
    let mut changes = discovery.watch_service().expect("watchable");
    wait_for("watch established", || store.watch_calls.load(Ordering::SeqCst) == 1).await;

    store.put(vec![registered("tcp@127.0.0.1:2", "state=inactive")]).await;
    let update = timeout(WAIT, changes.recv()).await.expect("update in time").expect("channel open");
    assert_eq!(update, vec![KVPair::new("tcp@127.0.0.1:2", "state=inactive")]);
    assert_eq!(discovery.get_services(), update);
}

#[tokio::test]
async fn kv_store_watch_is_retried_with_backoff() {
    let store = Arc::new(MemStore::default());
    store.failing_watches.store(3, Ordering::SeqCst);
    let discovery = KvStoreDiscovery::new(BASE, store.clone(), fast_retry(-1)).await.expect("discovery");
    let mut changes = discovery.watch_service().expect("watchable");

    wait_for("watch established after failures", || store.watch_calls.load(Ordering::SeqCst) == 4).await;
    store.put(vec![registered("tcp@127.0.0.1:3", "")]).await;
    let update = timeout(WAIT, changes.recv()).await.expect("update in time").expect("channel open");
    assert_eq!(update, vec![KVPair::new("tcp@127.0.0.1:3", "")]);
}

#[tokio::test]
async fn kv_store_watch_gives_up_after_the_configured_retries() {
    let store = Arc::new(MemStore::default());
    store.failing_watches.store(usize::MAX, Ordering::SeqCst);
    let _discovery = KvStoreDiscovery::new(BASE, store.clone(), fast_retry(2)).await.expect("discovery");

    wait_for("all attempts made", || store.watch_calls.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.watch_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn kv_store_lost_watch_is_reestablished() {
    let store = Arc::new(MemStore::with(vec![registered("tcp@127.0.0.1:1", "")]));
    let discovery = KvStoreDiscovery::new(BASE, store.clone(), fast_retry(-1)).await.expect("discovery");
    let mut changes = discovery.watch_service().expect("watchable");
    wait_for("watch established", || store.watch_calls.load(Ordering::SeqCst) == 1).await;

    store.drop_watches();
    wait_for("watch re-established", || store.watch_calls.load(Ordering::SeqCst) == 2).await;

    store.put(vec![registered("tcp@127.0.0.1:4", "")]).await;
    let update = timeout(WAIT, changes.recv()).await.expect("update in time").expect("channel open");
    assert_eq!(update, vec![KVPair::new("tcp@127.0.0.1:4", "")]);
}

#[tokio::test]
async fn kv_store_close_stops_watching() {
    let store = Arc::new(MemStore::with(vec![registered("tcp@127.0.0.1:1", "")]));
    let discovery = KvStoreDiscovery::new(BASE, store.clone(), fast_retry(-1)).await.expect("discovery");
    let mut changes = discovery.watch_service().expect("watchable");
    wait_for("watch established", || store.watch_calls.load(Ordering::SeqCst) == 1).await;

    discovery.close();
    assert_eq!(timeout(WAIT, changes.recv()).await.expect("closed in time"), None);

    store.put(vec![registered("tcp@127.0.0.1:5", "")]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(discovery.get_services(), vec![KVPair::new("tcp@127.0.0.1:1", "")]);
}
