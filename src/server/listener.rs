//! Listener factory keyed by network name.
//!
//! - `tcp`, `tcp4`, `tcp6`, `http`: plain TCP listener (`http` adds the CONNECT
//!   bootstrap at the connection level);
//! - `reuseport`: TCP listener with `SO_REUSEPORT` set on unix targets;
//! - `unix`: Unix domain socket (unix targets only).

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};
use tracing::info;

use crate::error::{Error, Result};
use crate::share::BoxedStream;

const LISTEN_BACKLOG: u32 = 1024;

/// A bound listener of any supported network.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Binds `address` on `network`.
pub async fn listen(network: &str, address: &str) -> Result<Listener> {
    let listener = match network {
        "tcp" | "tcp4" | "tcp6" | "http" => Listener::Tcp(TcpListener::bind(address).await?),
        "reuseport" => Listener::Tcp(bind_reuseport(address).await?),
        #[cfg(unix)]
        "unix" => Listener::Unix(tokio::net::UnixListener::bind(address)?),
        other => return Err(Error::UnsupportedNetwork(other.to_string())),
    };
    info!("Listening on {}@{}", network, listener.local_addr().unwrap_or_else(|_| address.to_string()));
    Ok(listener)
}

async fn bind_reuseport(address: &str) -> Result<TcpListener> {
    let addr: SocketAddr = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {address}")))?;
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

impl Listener {
    /// Accepts one connection. Returns the stream and the peer address.
    pub async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, addr) = l.accept().await?;
                let peer = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix".to_string());
                Ok((Box::new(stream), peer))
            }
        }
    }

    /// The bound address. Useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            #[cfg(unix)]
            Listener::Unix(l) => Ok(l
                .local_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        }
    }
}
