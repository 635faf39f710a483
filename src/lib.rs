//! xrpc - an RPC framework for Tokio
//!
//! Clients invoke named service methods on remote servers over TCP, Unix
//! sockets or HTTP CONNECT. Many calls share one connection; each request
//! frame carries a sequence number so responses can come back in any order.
//!
//! ## Main Components
//!
//! - `protocol`: the frame format and the [`protocol::Message`] data model.
//!
//! - `codec`: payload encodings (raw bytes, JSON, MessagePack) selected per
//!   frame by its serialize type.
//!
//! - `client`: the connection multiplexer ([`client::Client`]) and the
//!   governance client ([`client::XClient`]) that adds service discovery,
//!   server selection and failure policies (fail-fast, fail-try, fail-over,
//!   broadcast, fork).
//!
//! - `server`: the dispatcher ([`server::Server`]) that serves registered
//!   [`server::Service`]s, one task per request.
//!
//! ## Usage
//!
//! Register a service on a server:
//!
//! ```ignore
//! let server = Server::new(ServerOption::default());
//! server.register(Service::new("Arith").method("Mul", method_fn(|_ctx, args: Args| async move {
//!     Ok(args.a * args.b)
//! })))?;
//! server.serve("tcp", "127.0.0.1:8972").await?;
//! ```
//!
//! and call it from a client:
//!
//! ```ignore
//! let discovery = Arc::new(Peer2PeerDiscovery::new("tcp@127.0.0.1:8972", ""));
//! let xclient = XClient::new("Arith", FailMode::Failtry, SelectMode::RandomSelect, discovery, ClientOption::default());
//! let product: i64 = xclient.call(&Context::background(), "Mul", &Args { a: 10, b: 20 }).await?;
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod share;

pub use error::{Error, MultiError, Result};
pub use share::Context;
