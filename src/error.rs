//! Error types for modelwire.
//!
//! Only [`RuntimeError::Transport`] (and a closed stream) ends a session.
//! Everything else is scoped to the control call that raised it and is
//! reported back to the host as a structured error result.

use thiserror::Error;

/// Main error type for runtime and protocol operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (malformed frame, bad segment, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A data-chunk frame named a request id with no waiting reader.
    #[error("No pending read for request id {0}")]
    UnknownRequest(u32),

    /// The peer closed the connection or the writer task is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Writing to the socket failed. The session cannot continue.
    #[error("Transport failure: {0}")]
    Transport(std::io::Error),

    /// Missing or invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using RuntimeError.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced to model code by data loaders, state loaders and
/// state providers.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// `next(n)` asked for more records than remain.
    #[error("Data loader exhausted: requested {requested} records but only {remaining} remain")]
    Exhausted { requested: usize, remaining: usize },

    /// `set_position` outside `0..=size`.
    #[error("Position {position} is out of range for a data loader of size {size}")]
    OutOfRange { position: i64, size: usize },

    /// Loaders in a shuffle group must all have the same size.
    #[error("Cannot shuffle in group: expected size {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },

    /// `shuffle_in_group` named a loader that is not in the map.
    #[error("No data loader named {0:?}")]
    UnknownLoader(String),

    /// The control call that created this loader has already returned.
    #[error("The call that owns this loader has already completed")]
    CallCompleted,

    /// The connection to the host is gone.
    #[error("Connection to host closed")]
    Disconnected,

    /// The host answered a read with data of the wrong shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<RuntimeError> for LoaderError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ConnectionClosed | RuntimeError::Transport(_) => LoaderError::Disconnected,
            other => LoaderError::Protocol(other.to_string()),
        }
    }
}

/// Errors returned by [`TrainTracker`](crate::training::TrainTracker).
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Progress or metrics were reported after the session stopped being active.
    #[error("Cannot report {what} for training session {session}: the session is {status}")]
    NotActive {
        what: &'static str,
        session: String,
        status: &'static str,
    },

    /// A reported value cannot be sent to the host.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection to the host is gone.
    #[error("Connection to host closed")]
    Disconnected,
}

impl From<RuntimeError> for TrackerError {
    fn from(_: RuntimeError) -> Self {
        TrackerError::Disconnected
    }
}

/// Why a control call failed, as reported to the host in its reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The call named an instantiated model that is unknown, disposed or
    /// failed to instantiate.
    #[error("Instantiated model {0:?} not found")]
    ModelNotFound(String),

    /// Model code returned an error or panicked.
    #[error("Model code failed: {0}")]
    Exception(String),

    /// The call's parameters were missing or malformed.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// No method with this name.
    #[error("Unknown method {0:?}")]
    UnknownMethod(String),

    /// A model call arrived before any model was loaded.
    #[error("No model has been initialized")]
    NotInitialized,
}

/// Suffix appended to exception details cut at the configured length.
const SHORTENED_SUFFIX: &str = " (exception shortened - actual exception contained";

impl CallError {
    /// The `{"error": ...}` object sent to the host.
    ///
    /// Exception details longer than `max_details` characters are cut.
    pub fn to_result(&self, max_details: usize) -> serde_json::Value {
        use serde_json::json;

        let error = match self {
            CallError::ModelNotFound(_) => json!("instantiated_model_not_found"),
            CallError::Exception(details) => json!({
                "code": "exception",
                "details": shorten_details(details, max_details),
            }),
            CallError::InvalidArguments(details) => json!({
                "code": "invalid_arguments",
                "details": details,
            }),
            CallError::UnknownMethod(method) => json!({
                "code": "unknown_method",
                "details": format!("unknown method {:?}", method),
            }),
            CallError::NotInitialized => json!({ "code": "not_initialized" }),
        };
        json!({ "error": error })
    }
}

fn shorten_details(details: &str, max_chars: usize) -> std::borrow::Cow<'_, str> {
    match details.char_indices().nth(max_chars) {
        None => std::borrow::Cow::Borrowed(details),
        Some((cut, _)) => {
            let dropped = details[cut..].chars().count();
            std::borrow::Cow::Owned(format!(
                "{}{} {} more characters)",
                &details[..cut],
                SHORTENED_SUFFIX,
                dropped
            ))
        }
    }
}
