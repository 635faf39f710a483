//! Pending-call registry for one connection.
//!
//! Every request that expects a response registers a resolver under its
//! sequence number. The resolver is consumed by exactly one of:
//!
//! - the read loop, when the matching response arrives;
//! - [`PendingCalls::close_all`], when the connection dies;
//! - the sender itself, when writing the request failed.
//!
//! Once closed, the registry refuses new registrations so no call can slip in
//! after the final drain and wait forever.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Completes one in-flight call with the response frame or an error.
pub(crate) type Resolver = Box<dyn FnOnce(Result<Message>) + Send>;

#[derive(Default)]
struct Registry {
    calls: HashMap<u64, Resolver>,
    closed: Option<String>,
}

/// In-flight calls keyed by sequence number.
#[derive(Default)]
pub(crate) struct PendingCalls {
    registry: Mutex<Registry>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a resolver for `seq`. Fails once the connection is closed.
    pub fn register(&self, seq: u64, resolver: Resolver) -> Result<()> {
        let mut registry = self.lock();
        if let Some(reason) = &registry.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        registry.calls.insert(seq, resolver);
        Ok(())
    }

    /// Resolves the call registered for `seq`.
    ///
    /// Returns false when nothing is registered: a late, duplicate or stale response.
    pub fn resolve(&self, seq: u64, result: Result<Message>) -> bool {
        let resolver = self.lock().calls.remove(&seq);
        match resolver {
            Some(resolver) => {
                resolver(result);
                true
            }
            None => false,
        }
    }

    /// Removes the call registered for `seq` without resolving it.
    pub fn remove(&self, seq: u64) -> Option<Resolver> {
        self.lock().calls.remove(&seq)
    }

    /// Marks the registry closed and fails every remaining call with `reason`.
    pub fn close_all(&self, reason: &str) {
        let drained: Vec<Resolver> = {
            let mut registry = self.lock();
            if registry.closed.is_none() {
                registry.closed = Some(reason.to_string());
            }
            registry.calls.drain().map(|(_, r)| r).collect()
        };
        for resolver in drained {
            resolver(Err(Error::ConnectionClosed(reason.to_string())));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
