//! Error types for lumen-core

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for lumen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the lumen dispatcher
#[derive(Debug, Error)]
pub enum Error {
    /// Route pattern failed validation
    #[error("Invalid route pattern: {0}")]
    InvalidPattern(#[from] lumen_router::PatternError),

    /// Invalid HTTP method
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// Request is not a WebSocket upgrade
    #[error("Not a WebSocket upgrade request")]
    NotUpgrade,

    /// Malformed upgrade handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Origin predicate rejected the upgrade
    #[error("Origin rejected: {0}")]
    OriginRejected(String),

    /// Transport did not provide an upgrade handle
    #[error("Connection cannot be upgraded")]
    UpgradeUnavailable,

    /// Hub did not accept the connection in time
    #[error("Hub '{hub}' registration timed out after {timeout:?}")]
    RegisterTimeout { hub: String, timeout: Duration },

    /// Hub loop is no longer running
    #[error("Hub '{0}' is closed")]
    HubClosed(String),

    /// Body too large
    #[error("Body too large: exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper error
    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    /// App already served and shut down
    #[error("App has been shut down")]
    Stopped,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status sent to the client when this error ends a request
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotUpgrade | Error::Handshake(_) | Error::Json(_) | Error::InvalidMethod(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::OriginRejected(_) => StatusCode::FORBIDDEN,
            Error::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
