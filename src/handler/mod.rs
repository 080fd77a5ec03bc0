//! Handler module - control-call dispatch.
//!
//! Provides:
//! - [`MethodTable`] - maps method names to handlers and call kinds
//! - [`CallContext`] - what a handler can reach: host, loaders, shared state
//! - [`method_table`] - the table with every control method registered
//!
//! Handlers return a [`CallOutcome`] or a [`CallError`](crate::error::CallError);
//! the runtime turns either into the reply of a correlated call.

mod context;
mod methods;
mod registry;

pub use context::{user_code, CallContext, CallOutcome, RuntimeState, DEFAULT_MAX_ERROR_DETAILS};
pub use methods::method_table;
pub use registry::{BoxFuture, CallKind, CallResult, Method, MethodTable, TypedMethod};
