//! Error types for tether-core.

use thiserror::Error;

/// Result type alias for tether-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while serving requests.
///
/// Every variant renders to the message that ends up in an `{error}`
/// response envelope, so the `Display` strings are part of the wire contract.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Method name not in the supported set.
    #[error("unknown method")]
    UnknownMethod,

    /// Request body could not be decoded into an envelope.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Parameters did not match the method's shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A required `run_id` parameter was absent.
    #[error("missing run_id")]
    MissingRunId,

    /// No run with the given identifier.
    #[error("run_id not found")]
    RunNotFound,

    /// A path-like parameter fell outside the allow-list.
    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    /// The host application reported a failure.
    #[error("{0}")]
    Host(#[from] crate::host::HostError),

    /// A blocking worker panicked or was torn down.
    #[error("worker failed: {0}")]
    Worker(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
