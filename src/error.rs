//! Error types shared by the client, the server and the wire layer.
//!
//! Errors fall into a few scopes:
//!
//! - transport and framing errors (`Io`, `Protocol`, `ConnectionClosed`) are fatal
//!   to the connection they happened on;
//! - codec and dispatch errors (`Codec`, `UnsupportedCodec`, `Service`) belong to a
//!   single call and never tear the connection down;
//! - governance errors (`NoServer`, `Shutdown`) are returned without any retry.

use std::fmt;
use std::io;

use crate::protocol::SerializeType;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by xrpc clients and servers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Dial failure, read/write failure or deadline expiry on the transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or truncated frame. The stream cannot be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// No codec is configured for the serialize type carried in the header.
    #[error("can not find codec for {0:?}")]
    UnsupportedCodec(SerializeType),

    /// The remote service answered with an Error status.
    #[error("{0}")]
    Service(String),

    /// The connection went away while the call was in flight.
    #[error("connection is shut down: {0}")]
    ConnectionClosed(String),

    /// The call deadline or the fan-out bound expired first.
    #[error("call timed out")]
    Timeout,

    /// The selector found no eligible server.
    #[error("can not find any server")]
    NoServer,

    /// The client was closed and accepts no more calls.
    #[error("client is shut down")]
    Shutdown,

    /// The server was closed.
    #[error("server closed")]
    ServerClosed,

    /// A service could not be registered.
    #[error("register: {0}")]
    Register(String),

    /// The requested transport is not available in this build.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// HTTP CONNECT bootstrap was refused.
    #[error("unexpected HTTP response: {0}")]
    Http(String),

    /// Several independent failures, e.g. while closing cached connections.
    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl Error {
    /// Governance errors are returned to the caller immediately and never retried.
    pub fn is_governance(&self) -> bool {
        matches!(self, Error::NoServer | Error::Shutdown)
    }

    /// Errors after which the connection a call travelled on is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

/// A collection of errors reported together.
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<Error>,
}

impl MultiError {
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiple errors:")?;
        for e in &self.errors {
            write!(f, " {e};")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
