//! Method registry consulted for every inbound request.
//!
//! The server resolves the handler from the request header before touching
//! the body. The handler decides the argument type, so decoding happens on
//! the connection's read loop and only the invocation runs in a spawned task.

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use proven_rpc_codec::{CodecError, CodecType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Invocation produced by a handler: resolves to the encoded reply, or to the
/// error text placed in the response header.
pub type Invocation = BoxFuture<'static, std::result::Result<Bytes, String>>;

/// Per-request details passed to handlers that ask for them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallContext {
    /// Sequence number chosen by the client.
    pub seq: u64,

    /// Method named in the request header.
    pub service_method: String,
}

/// Handles requests for one method.
pub trait MethodHandler: Send + Sync + 'static {
    /// Decodes `args` and returns the invocation to run.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` cannot be decoded into the method's argument
    /// type. The server answers such requests with an invalid-request error.
    fn prepare(
        &self,
        ctx: CallContext,
        codec_type: CodecType,
        args: &[u8],
    ) -> std::result::Result<Invocation, CodecError>;
}

/// Adapts an async function into a [`MethodHandler`].
struct FnHandler<F, A> {
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<F, A, R, E, Fut> MethodHandler for FnHandler<F, A>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize,
    E: fmt::Display,
{
    fn prepare(
        &self,
        ctx: CallContext,
        codec_type: CodecType,
        args: &[u8],
    ) -> std::result::Result<Invocation, CodecError> {
        let args: A = codec_type.decode(args)?;
        let fut = (self.f)(ctx, args);

        Ok(Box::pin(async move {
            let reply = fut.await.map_err(|e| e.to_string())?;
            codec_type.encode(&reply).map_err(|e| e.to_string())
        }))
    }
}

/// Placeholder handler: takes a string argument and replies `rpc resp {seq}`.
///
/// Useful as a fallback while real services are being wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceReply;

impl MethodHandler for SequenceReply {
    fn prepare(
        &self,
        ctx: CallContext,
        codec_type: CodecType,
        args: &[u8],
    ) -> std::result::Result<Invocation, CodecError> {
        let args: String = codec_type.decode(args)?;
        debug!(seq = ctx.seq, method = %ctx.service_method, %args, "sequence reply");

        let reply = format!("rpc resp {}", ctx.seq);
        Ok(Box::pin(async move {
            codec_type.encode(&reply).map_err(|e| e.to_string())
        }))
    }
}

/// Maps `Service.Method` names to handlers.
#[derive(Clone, Default)]
pub struct Registry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    fallback: Option<Arc<dyn MethodHandler>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async function taking the decoded arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMethod`] if `name` is already registered.
    pub fn register<F, A, R, E, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        self.register_with_context(name, move |_ctx: CallContext, args: A| f(args))
    }

    /// Registers an async function taking the call context and the decoded
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMethod`] if `name` is already registered.
    pub fn register_with_context<F, A, R, E, Fut>(
        &mut self,
        name: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize,
        E: fmt::Display,
    {
        self.register_handler(
            name,
            FnHandler {
                f,
                _args: PhantomData,
            },
        )
    }

    /// Registers a handler object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMethod`] if `name` is already registered.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl MethodHandler,
    ) -> Result<()> {
        match self.methods.entry(name.into()) {
            Entry::Occupied(entry) => Err(Error::DuplicateMethod(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    /// Sets the handler used when no registered name matches.
    #[must_use]
    pub fn with_fallback(mut self, handler: impl MethodHandler) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Finds the handler for `service_method`.
    #[must_use]
    pub fn resolve(&self, service_method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods
            .get(service_method)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Number of registered methods, not counting the fallback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
