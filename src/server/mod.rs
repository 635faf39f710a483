//! Server dispatcher.
//!
//! The server accepts connections, reads request frames off each one in a
//! loop, and handles every request in its own task so one slow handler never
//! blocks the connection. Responses are written back through a per-connection
//! write lock in whatever order handlers finish.
//!
//! Per-request failures (unknown service or method, undecodable payload,
//! handler error, handler panic, refused auth, a reply too large to frame)
//! become Error-status responses. Only transport and framing errors close a
//! connection, including a response write that failed or timed out halfway.

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::codec::Codecs;
use crate::error::{Error, Result};
use crate::protocol::{self, CompressType, Message, MessageType};
use crate::share::{self, BoxedStream};

mod listener;
mod service;

pub use listener::{listen, Listener};
pub use service::{method_fn, Context, FnMethod, Method, Service};

/// Checks the token a request carries under [`share::AUTH_KEY`] (empty when
/// absent). An `Err` refuses the request with its message.
pub type AuthFn = dyn Fn(&Message, &str) -> std::result::Result<(), String> + Send + Sync;

/// Write side of one connection, shared by the tasks answering its requests.
struct ConnWriter {
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    broken: AtomicBool,
    failed: Notify,
}

impl ConnWriter {
    fn new(writer: WriteHalf<BoxedStream>) -> Self {
        Self { writer: tokio::sync::Mutex::new(writer), broken: AtomicBool::new(false), failed: Notify::new() }
    }

    /// Writes one response frame. After a failed write the stream may hold a
    /// partial frame: nothing more is written and the read loop is told to stop.
    async fn write(&self, frame: &[u8], deadline: Option<Duration>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("an earlier response write failed".to_string()));
        }
        let res = protocol::write_frame(&mut *writer, frame, deadline).await;
        if res.is_err() {
            self.broken.store(true, Ordering::SeqCst);
            self.failed.notify_one();
        }
        res
    }
}

const MIN_ACCEPT_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerOption {
    /// Bound on reading one request frame. Expiry closes the connection.
    pub read_timeout: Option<Duration>,
    /// Bound on writing one response frame.
    pub write_timeout: Option<Duration>,
    /// Path accepted by the HTTP CONNECT bootstrap.
    pub rpc_path: String,
}

impl Default for ServerOption {
    fn default() -> Self {
        Self { read_timeout: None, write_timeout: None, rpc_path: share::DEFAULT_RPC_PATH.to_string() }
    }
}

impl ServerOption {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_rpc_path(mut self, rpc_path: impl Into<String>) -> Self {
        self.rpc_path = rpc_path.into();
        self
    }
}

/// An RPC server. Cheap to clone; clones share services and lifecycle.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    option: ServerOption,
    codecs: Arc<Codecs>,
    services: RwLock<HashMap<String, Arc<Service>>>,
    auth: RwLock<Option<Arc<AuthFn>>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(option: ServerOption) -> Server {
        Server::with_codecs(option, Arc::new(Codecs::default()))
    }

    pub fn with_codecs(option: ServerOption, codecs: Arc<Codecs>) -> Server {
        let (shutdown, _) = watch::channel(false);
        Server {
            inner: Arc::new(Inner {
                option,
                codecs,
                services: RwLock::new(HashMap::new()),
                auth: RwLock::new(None),
                shutdown,
            }),
        }
    }

    /// Registers `service` under its name.
    ///
    /// Fails when the service has no methods or the name is already taken.
    pub fn register(&self, service: Service) -> Result<()> {
        if service.is_empty() {
            return Err(Error::Register(format!("service {} has no methods", service.name())));
        }
        let mut services = self.inner.services.write().unwrap_or_else(|p| p.into_inner());
        if services.contains_key(service.name()) {
            return Err(Error::Register(format!("service already defined: {}", service.name())));
        }
        debug!("registered {:?}", service);
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Removes the service registered as `name`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.inner
            .services
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::Register(format!("service {name} not found")))
    }

    /// Installs the auth check run before every request is dispatched.
    pub fn set_auth<F>(&self, auth: F)
    where
        F: Fn(&Message, &str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        *self.inner.auth.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(auth));
    }

    /// Binds `address` on `network` and serves until [`Server::close`].
    pub async fn serve(&self, network: &str, address: &str) -> Result<()> {
        let listener = listen(network, address).await?;
        self.serve_listener(network, listener).await
    }

    /// Serves connections accepted on `listener` until [`Server::close`], which
    /// makes this return [`Error::ServerClosed`].
    ///
    /// `network` only decides whether connections start with the HTTP CONNECT
    /// bootstrap (`"http"`).
    pub async fn serve_listener(&self, network: &str, listener: Listener) -> Result<()> {
        let http = network == "http";
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(Error::ServerClosed);
        }

        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => {
                    info!("server closed, stop accepting on {}", listener.local_addr().unwrap_or_default());
                    return Err(Error::ServerClosed);
                }
                res = listener.accept() => res,
            };
            let (stream, remote) = match accepted {
                Ok(conn) => {
                    delay = Duration::ZERO;
                    conn
                }
                Err(e) if is_temporary(&e) => {
                    delay = if delay.is_zero() { MIN_ACCEPT_DELAY } else { (delay * 2).min(MAX_ACCEPT_DELAY) };
                    warn!("accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    return Err(e.into());
                }
            };

            info!("Accepting connection from {}", remote);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_conn(stream, &remote, http).await {
                    debug!("connection from {} closed: {:?}", remote, e);
                }
            });
        }
    }

    /// Stops accepting and closes every connection. Requests already being
    /// handled finish, but their responses may not be delivered.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    async fn serve_conn(&self, mut stream: BoxedStream, remote: &str, http: bool) -> anyhow::Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        if http {
            let connected = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                res = self.http_connect(&mut stream, remote) => res?,
            };
            if !connected {
                return Ok(());
            }
        }

        let (mut reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(ConnWriter::new(writer));

        let res = loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                _ = conn.failed.notified() => {
                    warn!("closing connection from {}: failed to write a response", remote);
                    break Err(anyhow::anyhow!("response write failed"));
                }
                res = protocol::read_message_timeout(&mut reader, self.inner.option.read_timeout) => res,
            };
            let req = match read {
                Ok(req) => req,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("client has closed this connection: {}", remote);
                    break Ok(());
                }
                Err(e) => {
                    warn!("failed to read request from {}: {}", remote, e);
                    break Err(e.into());
                }
            };
            if req.message_type != MessageType::Request {
                warn!("unexpected response frame seq:{} from {}", req.seq, remote);
                continue;
            }
            trace!("request seq:{} {}.{} from {}", req.seq, req.service_path(), req.service_method(), remote);

            let server = self.clone();
            let conn = conn.clone();
            let remote = remote.to_string();
            tokio::spawn(async move { server.handle_request(req, remote, conn).await });
        };

        let _ = conn.writer.lock().await.shutdown().await;
        res
    }

    /// Answers the CONNECT bootstrap. `false` means the peer was refused.
    async fn http_connect(&self, stream: &mut BoxedStream, remote: &str) -> anyhow::Result<bool> {
        let head = share::read_http_head(stream).await?;
        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default();
        let path = request_line.next().unwrap_or_default();

        if method != "CONNECT" {
            warn!("rejecting {} {} from {}: must CONNECT", method, path, remote);
            stream
                .write_all(b"HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n")
                .await?;
            return Ok(false);
        }
        if path != self.inner.option.rpc_path {
            warn!("rejecting CONNECT {} from {}: unknown path", path, remote);
            stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await?;
            return Ok(false);
        }
        stream.write_all(format!("HTTP/1.0 {}\n\n", share::HTTP_CONNECTED).as_bytes()).await?;
        Ok(true)
    }

    async fn handle_request(&self, req: Message, remote: String, conn: Arc<ConnWriter>) {
        let outcome = AssertUnwindSafe(self.dispatch(&req, &remote)).catch_unwind().await;

        let mut resp = req.reply();
        match outcome {
            Ok(Ok(payload)) => resp.payload = payload,
            Ok(Err(e)) => {
                debug!("{}.{} from {} failed: {}", req.service_path(), req.service_method(), remote, e);
                resp.set_error(e);
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("panic in {}.{} from {}: {}", req.service_path(), req.service_method(), remote, reason);
                resp.set_error(format!("internal error: {reason}"));
            }
        }

        if req.is_oneway() {
            return;
        }
        let Some(frame) = encode_response(&mut resp, &remote) else {
            return;
        };
        if let Err(e) = conn.write(&frame, self.inner.option.write_timeout).await {
            error!("failed to write response seq:{} to {}: {}", resp.seq, remote, e);
        }
    }

    async fn dispatch(&self, req: &Message, remote: &str) -> Result<Vec<u8>> {
        let auth = self.inner.auth.read().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(auth) = auth {
            let token = req.metadata.get(share::AUTH_KEY).map(String::as_str).unwrap_or_default();
            auth(req, token).map_err(Error::Service)?;
        }
        if req.compress_type != CompressType::None {
            return Err(Error::Codec(format!("unsupported compress type {:?}", req.compress_type)));
        }

        let service_path = req.service_path();
        let service_method = req.service_method();
        let service = self
            .inner
            .services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(service_path)
            .cloned()
            .ok_or_else(|| Error::Service(format!("can't find service {service_path}")))?;
        let handler = service
            .handler(service_method)
            .ok_or_else(|| Error::Service(format!("can't find method {service_method}")))?;
        let codec = self.inner.codecs.get(req.serialize_type)?;

        let ctx = Context::new(remote, req.metadata.clone());
        handler.handle(&ctx, codec, &req.payload).await
    }
}

/// Encodes `resp`, turning it into an Error-status response when the reply
/// cannot be framed.
fn encode_response(resp: &mut Message, remote: &str) -> Option<Vec<u8>> {
    let err = match resp.encode() {
        Ok(frame) => return Some(frame),
        Err(e) => e,
    };
    warn!("failed to encode response seq:{} to {}: {}", resp.seq, remote, err);
    resp.set_error(format!("failed to encode response: {err}"));
    if let Ok(frame) = resp.encode() {
        return Some(frame);
    }
    // the echoed request metadata alone is too large
    resp.metadata.retain(|k, _| k == share::SERVICE_ERROR);
    match resp.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("failed to encode error response seq:{} to {}: {}", resp.seq, remote, e);
            None
        }
    }
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE, EMFILE
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
