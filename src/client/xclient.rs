//! Governance client: one service, many servers.
//!
//! An [`XClient`] keeps the eligible server set up to date from a
//! [`ServiceDiscovery`], picks a server per call through a [`Selector`], keeps
//! one cached [`Client`] per server key, and applies a [`FailMode`] to
//! synchronous calls. [`XClient::broadcast`] and [`XClient::fork`] fan a call
//! out to every eligible server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::dial::split_network_and_address;
use crate::client::discovery::{KVPair, ServiceDiscovery};
use crate::client::selector::{filter_by_state_and_group, new_selector, SelectMode, Selector, ServerSet};
use crate::client::{Call, Client, ClientOption};
use crate::codec::{Codecs, Payload};
use crate::error::{Error, MultiError, Result};
use crate::share::Context;

/// How a synchronous call reacts to a failed attempt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FailMode {
    /// One attempt; the error is returned as is.
    #[default]
    Failfast,
    /// Up to `retries` attempts against the server selected first.
    Failtry,
    /// Up to `retries` attempts, selecting a server again after each failure.
    Failover,
}

/// Client of one service spread over a changing set of servers.
///
/// Must be created from within a Tokio runtime when the discovery can be
/// watched.
pub struct XClient {
    service_path: String,
    fail_mode: FailMode,
    option: ClientOption,
    codecs: Arc<Codecs>,
    selector: Box<dyn Selector>,
    // owned so the watched discovery lives as long as the client
    _discovery: Arc<dyn ServiceDiscovery>,
    servers: Arc<RwLock<ServerSet>>,
    clients: Arc<tokio::sync::RwLock<HashMap<String, Client>>>,
    shutdown: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl XClient {
    pub fn new(
        service_path: impl Into<String>,
        fail_mode: FailMode,
        select_mode: SelectMode,
        discovery: Arc<dyn ServiceDiscovery>,
        option: ClientOption,
    ) -> XClient {
        let servers = Arc::new(RwLock::new(servers_from(discovery.get_services(), &option.group)));
        let clients = Arc::new(tokio::sync::RwLock::new(HashMap::new()));

        let watcher = discovery
            .watch_service()
            .map(|changes| tokio::spawn(watch(changes, servers.clone(), clients.clone(), option.group.clone())));

        XClient {
            service_path: service_path.into(),
            fail_mode,
            option,
            codecs: Arc::new(Codecs::default()),
            selector: new_selector(select_mode),
            _discovery: discovery,
            servers,
            clients,
            shutdown: AtomicBool::new(false),
            watcher: Mutex::new(watcher),
        }
    }

    /// Replaces the built-in selector.
    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    /// Replaces the default codec configuration used by new connections.
    pub fn with_codecs(mut self, codecs: Arc<Codecs>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Snapshot of the eligible servers.
    pub fn servers(&self) -> ServerSet {
        self.servers.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Calls `service_method` on one selected server, applying the fail mode.
    pub async fn call<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        self.check_shutdown()?;
        let mut key = self.select(ctx)?;

        let attempts = match self.fail_mode {
            FailMode::Failfast => 1,
            FailMode::Failtry | FailMode::Failover => self.option.retries.max(1),
        };

        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 && self.fail_mode == FailMode::Failover {
                key = match self.select(ctx) {
                    Ok(key) => key,
                    Err(e) => return Err(last_err.unwrap_or(e)),
                };
            }
            match self.call_on(&key, ctx, service_method, args).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_governance() => return Err(e),
                Err(e) => {
                    if attempts > 1 {
                        warn!(
                            "{:?}: attempt {}/{} of {}.{} on {} failed: {}",
                            self.fail_mode, attempt + 1, attempts, self.service_path, service_method, key, e
                        );
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoServer))
    }

    /// Sends `service_method` to one selected server and returns the in-flight call.
    /// No fail mode applies.
    pub async fn go<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<Call<R>> {
        self.check_shutdown()?;
        let key = self.select(ctx)?;
        let client = self.get_cached_client(&key).await?;
        client.send(ctx, &self.service_path, service_method, args).await
    }

    /// Calls every eligible server concurrently. Succeeds only when all of them
    /// do, returning the first reply; otherwise returns the first error seen.
    /// Servers still silent after `fan_out_timeout` make the call fail with
    /// [`Error::Timeout`].
    pub async fn broadcast<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        self.check_shutdown()?;
        let keys = self.fan_out_keys()?;
        let mut calls: FuturesUnordered<_> =
            keys.iter().map(|key| self.call_on::<A, R>(key, ctx, service_method, args)).collect();

        let deadline = tokio::time::Instant::now() + self.option.fan_out_timeout;
        let mut first_reply = None;
        loop {
            match tokio::time::timeout_at(deadline, calls.next()).await {
                Ok(Some(Ok(reply))) => {
                    first_reply.get_or_insert(reply);
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => break,
                Err(_) => {
                    warn!("broadcast {}.{}: {} servers did not answer in time", self.service_path, service_method, calls.len());
                    return Err(Error::Timeout);
                }
            }
        }
        first_reply.ok_or(Error::NoServer)
    }

    /// Calls every eligible server concurrently and returns the first successful
    /// reply. When every server fails, the last error is returned; when none
    /// answered successfully within `fan_out_timeout`, [`Error::Timeout`].
    pub async fn fork<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        self.check_shutdown()?;
        let keys = self.fan_out_keys()?;
        let mut calls: FuturesUnordered<_> =
            keys.iter().map(|key| self.call_on::<A, R>(key, ctx, service_method, args)).collect();

        let deadline = tokio::time::Instant::now() + self.option.fan_out_timeout;
        let mut last_err = None;
        loop {
            match tokio::time::timeout_at(deadline, calls.next()).await {
                Ok(Some(Ok(reply))) => return Ok(reply),
                Ok(Some(Err(e))) => {
                    debug!("fork {}.{}: one server failed: {}", self.service_path, service_method, e);
                    last_err = Some(e);
                }
                Ok(None) => break,
                Err(_) => return Err(Error::Timeout),
            }
        }
        Err(last_err.unwrap_or(Error::NoServer))
    }

    /// Stops watching the discovery and closes every cached connection.
    /// Later calls fail with [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_watcher();

        let clients: Vec<(String, Client)> = self.clients.write().await.drain().collect();
        let mut errors = Vec::new();
        for (key, client) in clients {
            if let Err(e) = client.close().await {
                warn!("failed to close connection to {}: {}", key, e);
                errors.push(e);
            }
        }
        info!("xclient for {} closed", self.service_path);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(errors).into())
        }
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn stop_watcher(&self) {
        if let Some(handle) = self.watcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    fn select(&self, ctx: &Context) -> Result<String> {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        self.selector.select(ctx, &servers).ok_or(Error::NoServer)
    }

    fn fan_out_keys(&self) -> Result<Vec<String>> {
        let keys: Vec<String> = self.servers.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect();
        if keys.is_empty() {
            return Err(Error::NoServer);
        }
        Ok(keys)
    }

    async fn call_on<A: Payload, R: Payload>(
        &self,
        key: &str,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        let client = self.get_cached_client(key).await?;
        let res = client.call(ctx, &self.service_path, service_method, args).await;
        if let Err(e) = &res {
            if e.is_connection_fatal() {
                self.evict(key).await;
            }
        }
        res
    }

    /// Returns the live connection for `key`, dialing a new one when none is
    /// cached or the cached one is closing.
    async fn get_cached_client(&self, key: &str) -> Result<Client> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(key) {
                if !client.is_closing() {
                    return Ok(client.clone());
                }
            }
        }

        let mut clients = self.clients.write().await;
        // Another caller may have dialed while we waited for the write lock.
        if let Some(client) = clients.get(key) {
            if !client.is_closing() {
                return Ok(client.clone());
            }
            clients.remove(key);
        }
        self.check_shutdown()?;

        let (network, address) = split_network_and_address(key);
        let client = Client::connect(network, address, self.option.clone(), self.codecs.clone()).await?;
        debug!("connected to {}", key);
        clients.insert(key.to_string(), client.clone());
        Ok(client)
    }

    async fn evict(&self, key: &str) {
        let mut clients = self.clients.write().await;
        if clients.get(key).is_some_and(Client::is_closing) {
            debug!("removing closed connection to {}", key);
            clients.remove(key);
        }
    }
}

impl Drop for XClient {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

fn servers_from(pairs: Vec<KVPair>, group: &str) -> ServerSet {
    let mut servers: ServerSet = pairs.into_iter().map(|p| (p.key, p.value)).collect();
    filter_by_state_and_group(group, &mut servers);
    servers
}

/// Replaces the server set with every list the discovery pushes, and closes
/// the cached connections to servers no longer in it.
async fn watch(
    mut changes: mpsc::Receiver<Vec<KVPair>>,
    servers: Arc<RwLock<ServerSet>>,
    clients: Arc<tokio::sync::RwLock<HashMap<String, Client>>>,
    group: String,
) {
    while let Some(pairs) = changes.recv().await {
        let latest = servers_from(pairs, &group);
        debug!("server set updated: {} eligible servers", latest.len());

        *servers.write().unwrap_or_else(|p| p.into_inner()) = latest.clone();

        let removed: Vec<Client> = {
            let mut clients = clients.write().await;
            let gone: Vec<String> = clients.keys().filter(|key| !latest.contains_key(*key)).cloned().collect();
            gone.iter().filter_map(|key| clients.remove(key)).collect()
        };

        for client in removed {
            debug!("closing connection to removed server {}", client.remote());
            if let Err(e) = client.close().await {
                warn!("failed to close connection to {}: {}", client.remote(), e);
            }
        }
    }
    debug!("discovery watch channel closed");
}
