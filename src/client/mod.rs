//! Client side: single-connection multiplexer and multi-server governance.

mod connection;
pub mod dial;
pub mod discovery;
mod option;
mod pending;
pub mod selector;
mod xclient;

pub use connection::{Call, Client};
pub use discovery::{
    KVPair, KvStore, KvStoreDiscovery, MultipleServersDiscovery, Peer2PeerDiscovery, ServiceDiscovery, WatchConfig,
};
pub use option::ClientOption;
pub use selector::{SelectMode, Selector, ServerSet};
pub use xclient::{FailMode, XClient};
