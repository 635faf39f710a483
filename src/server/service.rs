//! Explicit service registry.
//!
//! A [`Service`] is a named set of methods. Each method is a typed [`Method`]
//! implementation; the registry erases the argument and reply types behind
//! [`Handler`] so the dispatcher can decode, invoke and encode without knowing
//! them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::codec::{Codec, Payload};
use crate::error::{Error, Result};

/// What a handler knows about the request it serves.
#[derive(Clone, Debug, Default)]
pub struct Context {
    remote_addr: String,
    metadata: HashMap<String, String>,
}

impl Context {
    pub fn new(remote_addr: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        Self { remote_addr: remote_addr.into(), metadata }
    }

    /// Address of the calling peer, as reported by the transport.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Request metadata, including the service path and method keys.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// One remotely callable method.
///
/// An `Err` is sent back to the caller as an Error-status response carrying the
/// error's message; no reply payload is sent in that case.
#[async_trait]
pub trait Method: Send + Sync + 'static {
    type Args: Payload;
    type Reply: Payload;

    async fn call(&self, ctx: &Context, args: Self::Args) -> anyhow::Result<Self::Reply>;
}

/// A [`Method`] backed by an async closure. See [`method_fn`].
pub struct FnMethod<F, A, R> {
    f: F,
    _types: PhantomData<fn(A) -> R>,
}

/// Wraps an async closure taking the handler context and the decoded arguments.
pub fn method_fn<F, Fut, A, R>(f: F) -> FnMethod<F, A, R>
where
    F: Fn(Context, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    A: Payload,
    R: Payload,
{
    FnMethod { f, _types: PhantomData }
}

#[async_trait]
impl<F, Fut, A, R> Method for FnMethod<F, A, R>
where
    F: Fn(Context, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    A: Payload,
    R: Payload,
{
    type Args = A;
    type Reply = R;

    async fn call(&self, ctx: &Context, args: A) -> anyhow::Result<R> {
        (self.f)(ctx.clone(), args).await
    }
}

/// Type-erased method: raw payload in, raw payload out.
pub(crate) trait Handler: Send + Sync {
    fn handle<'a>(&'a self, ctx: &'a Context, codec: Codec, payload: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>>;
}

impl<M: Method> Handler for M {
    fn handle<'a>(&'a self, ctx: &'a Context, codec: Codec, payload: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let args = codec.decode::<M::Args>(payload)?;
            let reply = self.call(ctx, args).await.map_err(|e| Error::Service(format!("{e:#}")))?;
            codec.encode(&reply)
        })
    }
}

/// A named collection of methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: HashMap::new() }
    }

    /// Adds `method` under `name`, replacing any method of the same name.
    pub fn method<M: Method>(mut self, name: impl Into<String>, method: M) -> Self {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.method_names().collect();
        methods.sort_unstable();
        f.debug_struct("Service").field("name", &self.name).field("methods", &methods).finish()
    }
}
