//! Error types for skein.
//!
//! Consumer-visible failures map onto five kinds: connectivity, no provider,
//! no method, timeout and invocation. The remaining variants cover framing,
//! serialization and lifecycle problems inside the engine itself.

use std::time::Duration;
use thiserror::Error;

/// Wire error code: frame payload could not be parsed.
pub const CODE_PARSE_ERROR: i32 = -32700;
/// Wire error code: provider has no registration for the service+method.
pub const CODE_NO_METHOD: i32 = -32601;
/// Wire error code: the target method raised during execution.
pub const CODE_INVOCATION: i32 = -32603;
/// Wire error code: endpoint unreachable, disconnected or timed out.
pub const CODE_CONNECTIVITY: i32 = -32000;
/// Wire error code: no provider registered for the service.
pub const CODE_NO_PROVIDER: i32 = -32001;
/// Wire error code: the provider is shutting down.
pub const CODE_UNAVAILABLE: i32 = -32002;

/// Main error type for the skein library.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Endpoint {address} is not connected: {message}")]
    Connectivity { address: String, message: String },

    #[error("{service} has no provider")]
    NoProvider { service: String },

    #[error("{service} has no method {method}")]
    NoMethod { service: String, method: String },

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    /// The provider answered with an error Response.
    #[error("Remote call {service}.{method} failed ({code}): {message}")]
    Invocation {
        service: String,
        method: String,
        code: i32,
        message: String,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{service} declares method {method} more than once")]
    DuplicateMethod { service: String, method: String },

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Discovery error: {message}")]
    Discovery { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for skein operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Build a connectivity error for `address`.
    pub fn connectivity(address: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Connectivity {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Wire error code carried in error Responses.
    ///
    /// - -32700: Parse error
    /// - -32601: No such method
    /// - -32603: Invocation failure (and any other internal error)
    /// - -32000: Connectivity or timeout
    /// - -32001: No provider for service
    /// - -32002: Provider unavailable (shutting down)
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Connectivity { .. } | RpcError::Timeout { .. } => CODE_CONNECTIVITY,
            RpcError::NoProvider { .. } => CODE_NO_PROVIDER,
            RpcError::NoMethod { .. } => CODE_NO_METHOD,
            RpcError::Invocation { code, .. } => *code,
            RpcError::Json { .. } | RpcError::Protocol(_) | RpcError::FrameTooLarge { .. } => {
                CODE_PARSE_ERROR
            }
            RpcError::PoolShutdown => CODE_UNAVAILABLE,
            _ => CODE_INVOCATION,
        }
    }

    /// Whether a caller could reasonably try the call again.
    ///
    /// The engine itself never retries; this is advisory.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Connectivity { .. } | RpcError::Timeout { .. } | RpcError::NoProvider { .. }
        )
    }
}
