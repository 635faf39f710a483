//! Connection multiplexer: many concurrent calls over one transport stream.
//!
//! Writes from concurrent callers are funneled through one write lock so
//! frames never interleave. A single background task reads response frames
//! for the whole lifetime of the connection and hands each one to the call
//! registered under its sequence number. Responses may arrive in any order.
//!
//! When the read task stops (end of stream, framing error, read deadline) every
//! call still pending is failed with a connection-closed error, so no caller
//! waits forever.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::dial;
use crate::client::pending::{PendingCalls, Resolver};
use crate::client::ClientOption;
use crate::codec::{Codecs, Payload};
use crate::error::{Error, Result};
use crate::protocol::{self, Message, MessageType};
use crate::share::{self, AsyncStream, BoxedStream, Context};

/// One connection to one server, shared by any number of concurrent calls.
///
/// Cheap to clone. The connection closes when [`Client::close`] is called, when
/// the stream fails, or when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    remote: String,
    option: ClientOption,
    codecs: Arc<Codecs>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    pending: Arc<PendingCalls>,
    seq: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop_reader(&self) {
        let handle = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.pending.close_all("client dropped");
        self.stop_reader();
    }
}

impl Client {
    /// Dials `address` over `network` and starts the read loop.
    pub async fn connect(
        network: &str,
        address: &str,
        option: ClientOption,
        codecs: Arc<Codecs>,
    ) -> Result<Client> {
        let stream = dial::connect(network, address, &option).await?;
        Ok(Client::from_stream(stream, format!("{network}@{address}"), option, codecs))
    }

    /// Wraps an already established stream and starts the read loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, remote: String, option: ClientOption, codecs: Arc<Codecs>) -> Client
    where
        S: AsyncStream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let pending = Arc::new(PendingCalls::new());

        let handle = tokio::spawn(input(reader, pending.clone(), remote.clone(), option.read_timeout));

        Client {
            inner: Arc::new(Inner {
                remote,
                option,
                codecs,
                writer: tokio::sync::Mutex::new(writer),
                pending,
                seq: AtomicU64::new(0),
                reader: Mutex::new(Some(handle)),
            }),
        }
    }

    /// `network@address` of the server this client talks to.
    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// True once the connection was closed or failed. Such a client accepts no calls.
    pub fn is_closing(&self) -> bool {
        self.inner.pending.is_closed()
    }

    /// Number of calls waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sends a request and returns immediately with a handle resolving to the reply.
    pub async fn send<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<Call<R>> {
        let mut req = self.build_request(ctx, service_path, service_method, args)?;
        req.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let seq = req.seq;
        let frame = req.encode()?;

        let (tx, rx) = oneshot::channel();
        let codecs = self.inner.codecs.clone();
        let resolver: Resolver = Box::new(move |res: Result<Message>| {
            let reply = res.and_then(|msg| {
                if let Some(err) = msg.error() {
                    return Err(Error::Service(err.to_string()));
                }
                codecs.get(msg.serialize_type)?.decode::<R>(&msg.payload)
            });
            // The caller may have given up already; the reply is dropped then.
            let _ = tx.send(reply);
        });
        self.inner.pending.register(seq, resolver)?;

        if let Err(e) = self.write(seq, &frame).await {
            self.inner.pending.remove(seq);
            return Err(e);
        }

        Ok(Call {
            seq,
            service_path: service_path.to_string(),
            service_method: service_method.to_string(),
            done: rx,
        })
    }

    /// Sends a request and waits for the reply, or for the context deadline.
    ///
    /// When the deadline wins, the request stays registered; a response arriving
    /// later is dropped.
    pub async fn call<A: Payload, R: Payload>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        let call = self.send(ctx, service_path, service_method, args).await?;
        match ctx.deadline() {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, call).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::Timeout),
                }
            }
            None => call.await,
        }
    }

    /// Sends a one-way request. Nothing is registered and no response is expected.
    pub async fn send_oneway<A: Payload>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<()> {
        let mut req = self.build_request(ctx, service_path, service_method, args)?;
        req.oneway = true;
        req.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let frame = req.encode()?;
        self.write(req.seq, &frame).await
    }

    /// Closes the connection. Calls still pending fail with a connection-closed error.
    pub async fn close(&self) -> Result<()> {
        self.inner.pending.close_all("client closed");
        self.inner.stop_reader();
        let mut writer = self.inner.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn build_request<A: Payload>(
        &self,
        ctx: &Context,
        service_path: &str,
        service_method: &str,
        args: &A,
    ) -> Result<Message> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed(format!("connection to {} is closing", self.inner.remote)));
        }
        let codec = self.inner.codecs.get(self.inner.option.serialize_type)?;

        let mut req = Message::request(service_path, service_method);
        for (k, v) in ctx.metadata() {
            req.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if let Some(token) = &self.inner.option.auth_token {
            req.metadata.insert(share::AUTH_KEY.to_string(), token.clone());
        }
        req.serialize_type = self.inner.option.serialize_type;
        req.compress_type = self.inner.option.compress_type;
        req.payload = codec.encode(args)?;
        Ok(req)
    }

    /// Writes an encoded request frame. A failed write may leave a partial frame
    /// behind, so it closes the connection.
    async fn write(&self, seq: u64, frame: &[u8]) -> Result<()> {
        let res = {
            let mut writer = self.inner.writer.lock().await;
            trace!("Writing request seq:{} to {}, length:{}", seq, self.inner.remote, frame.len());
            protocol::write_frame(&mut *writer, frame, self.inner.option.write_timeout).await
        };
        if let Err(e) = &res {
            error!("failed to write request to {}: {}", self.inner.remote, e);
            self.inner.pending.close_all(&e.to_string());
            self.inner.stop_reader();
        }
        res
    }
}

/// Read loop: resolves pending calls until the stream ends or fails.
async fn input(
    mut reader: ReadHalf<BoxedStream>,
    pending: Arc<PendingCalls>,
    remote: String,
    read_timeout: Option<std::time::Duration>,
) {
    let reason = loop {
        match protocol::read_message_timeout(&mut reader, read_timeout).await {
            Ok(msg) => {
                if msg.message_type != MessageType::Response {
                    warn!("unexpected request frame seq:{} from {}", msg.seq, remote);
                    continue;
                }
                let seq = msg.seq;
                if !pending.resolve(seq, Ok(msg)) {
                    debug!("dropping response seq:{} from {}: no pending call", seq, remote);
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("server has closed this connection: {}", remote);
                break "connection closed by peer".to_string();
            }
            Err(e) => {
                error!("failed to read response from {}: {}", remote, e);
                break e.to_string();
            }
        }
    };
    trace!("read loop for {} finished, {} calls pending", remote, pending.len());
    pending.close_all(&reason);
}

/// Handle for an in-flight call. Resolves to the decoded reply.
///
/// Dropping the handle abandons the call; a response arriving afterwards is dropped.
pub struct Call<R> {
    seq: u64,
    service_path: String,
    service_method: String,
    done: oneshot::Receiver<Result<R>>,
}

impl<R> Call<R> {
    /// Sequence number of the request on its connection.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }
}

impl<R> Future for Call<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.done)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Error::ConnectionClosed("call abandoned".to_string()))))
    }
}
