//! Constants and types shared by clients and servers.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Path answered by servers bootstrapping over HTTP CONNECT.
pub const DEFAULT_RPC_PATH: &str = "/_rpcx_";

/// Status a server answers a successful HTTP CONNECT with.
pub const HTTP_CONNECTED: &str = "200 Connected to rpcx";

/// Longest HTTP head accepted during the CONNECT bootstrap.
const MAX_HTTP_HEAD: usize = 4096;

/// Metadata key naming the target service.
pub const SERVICE_PATH: &str = "__rpcx_service_path__";
/// Metadata key naming the target method.
pub const SERVICE_METHOD: &str = "__rpcx_service_method__";
/// Metadata key carrying the error string of an Error-status response.
pub const SERVICE_ERROR: &str = "__rpcx_error__";
/// Metadata key carrying the client's auth token.
pub const AUTH_KEY: &str = "__AUTH";

/// Per-call context: an optional deadline and request metadata.
///
/// The deadline releases the caller when it expires. The in-flight request is
/// not withdrawn; a response arriving afterwards is dropped.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    metadata: HashMap<String, String>,
}

impl Context {
    /// A context with no deadline and no metadata.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Adds a metadata entry sent along with every request made under this context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// A duplex byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Reads an HTTP head up to and including the empty line.
///
/// Reads byte by byte: whatever follows the head belongs to the frame protocol
/// and must stay in the stream.
pub(crate) async fn read_http_head<R>(src: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(128);
    loop {
        let byte = src.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "HTTP head too long"));
        }
    }
    String::from_utf8(head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "HTTP head is not valid utf-8"))
}
