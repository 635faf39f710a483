//! Client configuration.

use std::time::Duration;

use crate::protocol::{CompressType, SerializeType};
use crate::share;

/// Options shared by every connection a client opens.
#[derive(Clone, Debug)]
pub struct ClientOption {
    /// Attempts made by the fail-try and fail-over policies.
    pub retries: usize,
    /// Only servers advertising this group are eligible. Empty means any group.
    pub group: String,
    /// Path used by the HTTP CONNECT bootstrap.
    pub rpc_path: String,
    pub connect_timeout: Duration,
    /// Applied to every frame read. Expiry closes the connection.
    pub read_timeout: Option<Duration>,
    /// Applied to every frame write. Expiry closes the connection.
    pub write_timeout: Option<Duration>,
    pub serialize_type: SerializeType,
    pub compress_type: CompressType,
    /// Sent to the server under [`share::AUTH_KEY`].
    pub auth_token: Option<String>,
    /// Wall-clock bound for broadcast and fork.
    pub fan_out_timeout: Duration,
}

impl Default for ClientOption {
    fn default() -> Self {
        Self {
            retries: 3,
            group: String::new(),
            rpc_path: share::DEFAULT_RPC_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            write_timeout: None,
            serialize_type: SerializeType::MsgPack,
            compress_type: CompressType::None,
            auth_token: None,
            fan_out_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientOption {
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_serialize_type(mut self, serialize_type: SerializeType) -> Self {
        self.serialize_type = serialize_type;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_fan_out_timeout(mut self, timeout: Duration) -> Self {
        self.fan_out_timeout = timeout;
        self
    }
}
