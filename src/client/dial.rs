//! Transport bootstrap: turns a `(network, address)` pair into a duplex stream.
//!
//! Supported networks:
//!
//! - `tcp`, `tcp4`, `tcp6`, `reuseport`: plain TCP;
//! - `http`: TCP, then `CONNECT <rpc_path> HTTP/1.0` and a required
//!   `200 Connected to rpcx` status before switching to frames;
//! - `unix`: Unix domain socket (unix targets only).

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::client::ClientOption;
use crate::error::{Error, Result};
use crate::share::{self, BoxedStream};

/// Splits a server key `network@address`. A key without `@` is a TCP address.
pub fn split_network_and_address(server: &str) -> (&str, &str) {
    match server.split_once('@') {
        Some((network, address)) => (network, address),
        None => ("tcp", server),
    }
}

/// Dials `address` over `network`.
pub async fn connect(network: &str, address: &str, option: &ClientOption) -> Result<BoxedStream> {
    debug!("Dialing {}@{}", network, address);
    match network {
        "tcp" | "tcp4" | "tcp6" | "reuseport" => {
            Ok(Box::new(dial_tcp(address, option.connect_timeout).await?))
        }
        "http" => dial_http(address, option).await,
        #[cfg(unix)]
        "unix" => {
            let stream = with_timeout(option.connect_timeout, tokio::net::UnixStream::connect(address))
                .await
                .inspect_err(|e| error!("failed to dial server: {:?}", e))?;
            Ok(Box::new(stream))
        }
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    if timeout.is_zero() {
        return Ok(fut.await?);
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
    }
}

async fn dial_tcp(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = with_timeout(timeout, TcpStream::connect(address))
        .await
        .inspect_err(|e| error!("failed to dial server: {:?}", e))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn dial_http(address: &str, option: &ClientOption) -> Result<BoxedStream> {
    let path = if option.rpc_path.is_empty() { share::DEFAULT_RPC_PATH } else { &option.rpc_path };
    let mut conn = dial_tcp(address, option.connect_timeout).await?;

    conn.write_all(format!("CONNECT {path} HTTP/1.0\n\n").as_bytes()).await?;
    let head = share::read_http_head(&mut conn).await?;

    // "HTTP/1.0 200 Connected to rpcx"
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_once(' '))
        .map(|(_, status)| status.trim())
        .unwrap_or_default();
    if status != share::HTTP_CONNECTED {
        error!("unexpected HTTP response: {}", status);
        return Err(Error::Http(status.to_string()));
    }
    Ok(Box::new(conn))
}
