//! Service discovery: where the server set comes from.
//!
//! A discovery hands out the current server list and, optionally, a channel of
//! full replacement lists. Watch channels are bounded. A push to a slow watcher
//! waits at most `push_timeout` and is then dropped, so watchers may miss
//! intermediate lists but will see later ones. Dropping the receiver
//! unsubscribes.
//!
//! Implementations:
//!
//! - [`Peer2PeerDiscovery`]: a single fixed server, no updates;
//! - [`MultipleServersDiscovery`]: a fixed list replaced through [`MultipleServersDiscovery::update`];
//! - [`KvStoreDiscovery`]: servers registered under a path of a key/value store
//!   (etcd, zookeeper, consul, ...), with its own re-watch loop.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of every watch channel.
pub const WATCH_CHANNEL_CAPACITY: usize = 10;
/// Default bound on how long a push may wait for a full watch channel.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// One registered server: its key and its metadata string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KVPair {
    pub key: String,
    pub value: String,
}

impl KVPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Source of the server set.
pub trait ServiceDiscovery: Send + Sync {
    /// The current server list.
    fn get_services(&self) -> Vec<KVPair>;

    /// Subscribes to list replacements. `None` when the list never changes.
    fn watch_service(&self) -> Option<mpsc::Receiver<Vec<KVPair>>>;

    /// Stops background work. Existing watch channels are closed.
    fn close(&self) {}
}

/// Subscribers of one discovery.
#[derive(Default)]
struct Watchers {
    senders: Mutex<Vec<mpsc::Sender<Vec<KVPair>>>>,
}

impl Watchers {
    fn subscribe(&self) -> mpsc::Receiver<Vec<KVPair>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.senders.lock().unwrap_or_else(|p| p.into_inner()).push(tx);
        rx
    }

    /// Pushes `pairs` to every watcher, in subscription order.
    async fn publish(&self, pairs: &[KVPair], push_timeout: Duration) {
        let senders = self.senders.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for tx in senders {
            match tx.send_timeout(pairs.to_vec(), push_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!("chan is full and new change has been dropped");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!("removing closed watcher");
                    self.senders
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .retain(|s| !s.same_channel(&tx));
                }
            }
        }
    }

    fn clear(&self) {
        self.senders.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// A single, fixed server.
pub struct Peer2PeerDiscovery {
    server: String,
    metadata: String,
}

impl Peer2PeerDiscovery {
    pub fn new(server: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self { server: server.into(), metadata: metadata.into() }
    }
}

impl ServiceDiscovery for Peer2PeerDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        vec![KVPair::new(self.server.clone(), self.metadata.clone())]
    }

    fn watch_service(&self) -> Option<mpsc::Receiver<Vec<KVPair>>> {
        None
    }
}

/// A server list kept in memory and replaced wholesale by [`Self::update`].
pub struct MultipleServersDiscovery {
    pairs: RwLock<Vec<KVPair>>,
    watchers: Watchers,
    push_timeout: Duration,
}

impl MultipleServersDiscovery {
    pub fn new(pairs: Vec<KVPair>) -> Self {
        Self { pairs: RwLock::new(pairs), watchers: Watchers::default(), push_timeout: DEFAULT_PUSH_TIMEOUT }
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    /// Replaces the list and pushes it to every watcher.
    pub async fn update(&self, pairs: Vec<KVPair>) {
        *self.pairs.write().unwrap_or_else(|p| p.into_inner()) = pairs.clone();
        self.watchers.publish(&pairs, self.push_timeout).await;
    }
}

impl ServiceDiscovery for MultipleServersDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        self.pairs.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn watch_service(&self) -> Option<mpsc::Receiver<Vec<KVPair>>> {
        Some(self.watchers.subscribe())
    }

    fn close(&self) {
        self.watchers.clear();
    }
}

/// Minimal key/value store interface a registry backend must offer.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Every pair stored under `prefix`, with full keys.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<KVPair>>;

    /// A channel receiving the complete list under `prefix` on every change.
    /// The channel closing means the watch was lost and must be re-established.
    async fn watch_tree(&self, prefix: &str) -> anyhow::Result<mpsc::Receiver<Vec<KVPair>>>;
}

/// Re-watch behavior of a [`KvStoreDiscovery`].
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Failed watch attempts tolerated in a row. -1 retries forever.
    pub retries_after_watch_failed: i32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub push_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retries_after_watch_failed: -1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

/// Servers registered under `base_path` of a key/value store.
///
/// Keys are reported relative to `base_path`.
pub struct KvStoreDiscovery {
    pairs: Arc<RwLock<Vec<KVPair>>>,
    watchers: Arc<Watchers>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KvStoreDiscovery {
    /// Lists the current servers and starts watching `base_path`.
    pub async fn new<S: KvStore>(
        base_path: &str,
        store: Arc<S>,
        config: WatchConfig,
    ) -> anyhow::Result<Self> {
        let base_path = base_path.trim_end_matches('/').to_string();
        let initial = store.list(&base_path).await.map_err(|e| {
            error!("cannot get services of {} from registry: {:?}", base_path, e);
            e
        })?;

        let pairs = Arc::new(RwLock::new(strip_prefix(&base_path, initial)));
        let watchers = Arc::new(Watchers::default());
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(watch_loop(
            store,
            base_path,
            pairs.clone(),
            watchers.clone(),
            config,
            stop_rx,
        ));

        Ok(Self { pairs, watchers, stop, task: Mutex::new(Some(task)) })
    }
}

impl ServiceDiscovery for KvStoreDiscovery {
    fn get_services(&self) -> Vec<KVPair> {
        self.pairs.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn watch_service(&self) -> Option<mpsc::Receiver<Vec<KVPair>>> {
        Some(self.watchers.subscribe())
    }

    fn close(&self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.watchers.clear();
    }
}

impl Drop for KvStoreDiscovery {
    fn drop(&mut self) {
        self.close();
    }
}

fn strip_prefix(base_path: &str, pairs: Vec<KVPair>) -> Vec<KVPair> {
    let prefix = format!("{base_path}/");
    pairs
        .into_iter()
        .map(|p| KVPair {
            key: p.key.strip_prefix(&prefix).map(str::to_string).unwrap_or(p.key),
            value: p.value,
        })
        .collect()
}

async fn watch_loop<S: KvStore>(
    store: Arc<S>,
    base_path: String,
    pairs: Arc<RwLock<Vec<KVPair>>>,
    watchers: Arc<Watchers>,
    config: WatchConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let mut delay = Duration::ZERO;
        let mut retry = config.retries_after_watch_failed;
        let mut changes = loop {
            match store.watch_tree(&base_path).await {
                Ok(rx) => break rx,
                Err(e) => {
                    if config.retries_after_watch_failed >= 0 {
                        if retry <= 0 {
                            error!("can't watch {}: {:?}", base_path, e);
                            return;
                        }
                        retry -= 1;
                    }
                    delay = if delay.is_zero() {
                        config.initial_backoff
                    } else {
                        (delay * 2).min(config.max_backoff)
                    };
                    warn!(
                        "can not watch tree (with retry {}, sleep {:?}): {}: {:?}",
                        retry, delay, base_path, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => return,
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("discovery has been closed");
                    return;
                }
                ps = changes.recv() => match ps {
                    Some(ps) => {
                        let latest = strip_prefix(&base_path, ps);
                        *pairs.write().unwrap_or_else(|p| p.into_inner()) = latest.clone();
                        watchers.publish(&latest, config.push_timeout).await;
                    }
                    None => break,
                },
            }
        }
        warn!("chan is closed and will rewatch");
    }
}
