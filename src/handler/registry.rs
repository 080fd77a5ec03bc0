//! Method table for dispatching control calls by name.
//!
//! Each entry records whether the method is correlated (the host waits for
//! a reply carrying its `id`) or one-way (never replied to), next to a
//! handler that receives the deserialized `params` object.
//!
//! # Example
//!
//! ```ignore
//! use modelwire::handler::{CallKind, CallOutcome, MethodTable};
//!
//! let mut table = MethodTable::new();
//!
//! table.register("ping", CallKind::Correlated, |_: serde_json::Value, _ctx| async {
//!     Ok(CallOutcome::empty())
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{CallContext, CallOutcome};
use crate::error::CallError;

/// Result type for method handlers.
pub type CallResult = std::result::Result<CallOutcome, CallError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether the host expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Replied to with `{id, result}`.
    Correlated,
    /// Fire-and-forget; never replied to, even when `params.id` is present.
    OneWay,
}

/// Trait for method handlers.
pub trait Method: Send + Sync + 'static {
    /// Handle a call with its raw `params` object.
    ///
    /// Work done before the future is returned happens in dispatch order.
    fn call(&self, params: Value, ctx: CallContext) -> BoxFuture<'static, CallResult>;
}

/// Wrapper that deserializes `params` before calling the handler.
pub struct TypedMethod<F, T, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedMethod<F, T, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Method for TypedMethod<F, T, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    fn call(&self, params: Value, ctx: CallContext) -> BoxFuture<'static, CallResult> {
        let parsed: T = match serde_json::from_value(params) {
            Ok(v) => v,
            Err(e) => {
                let err = CallError::InvalidArguments(e.to_string());
                return Box::pin(async move { Err(err) });
            }
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

struct MethodEntry {
    handler: Box<dyn Method>,
    kind: CallKind,
}

/// Methods by name.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodEntry>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration under the same name wins.
    pub fn register<F, T, Fut>(&mut self, name: &str, kind: CallKind, handler: F)
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                handler: Box::new(TypedMethod::new(handler)),
                kind,
            },
        );
    }

    /// Call kind of `name`, `None` if unknown.
    pub fn kind(&self, name: &str) -> Option<CallKind> {
        self.methods.get(name).map(|e| e.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Start the handler for `name`.
    ///
    /// Whatever the handler does before handing back its future runs right
    /// here, so calls dispatched one after another see each other's
    /// registry changes in that order.
    pub fn dispatch(
        &self,
        name: &str,
        params: Value,
        ctx: CallContext,
    ) -> BoxFuture<'static, CallResult> {
        match self.methods.get(name) {
            Some(entry) => entry.handler.call(params, ctx),
            None => {
                let err = CallError::UnknownMethod(name.to_string());
                Box::pin(async move { Err(err) })
            }
        }
    }
}
