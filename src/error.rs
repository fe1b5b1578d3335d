//! Error types for the agent tunnel, push sources and configuration.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Tunnel-wide failure. Everything except [`TunnelError::Cancelled`] tears
/// down the current session and triggers a reconnect.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Could not establish the WebSocket connection within the connect timeout.
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// Connection dropped, stream reset, protocol violation.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("send response too slow (>{0:?})")]
    SendTimeout(Duration),

    #[error("stream receive too slow (>{0:?})")]
    ReceiveTimeout(Duration),

    /// Peer closed the stream (close frame or EOF).
    #[error("stream closed by peer")]
    StreamClosed,

    #[error("malformed frame: {0}")]
    Decode(serde_json::Error),

    #[error("cannot encode frame: {0}")]
    Encode(serde_json::Error),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("invalid connection metadata {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    /// Root or group cancellation; not a failure from the caller's perspective.
    #[error("cancelled")]
    Cancelled,

    /// A task of the group panicked or was aborted.
    #[error("task {name} failed: {reason}")]
    Task { name: &'static str, reason: String },
}

impl TunnelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failure to resolve a push source for an execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Backing record not visible (yet).
    #[error("execution {0} not found")]
    NotFound(String),

    #[error("execution {0} is finished")]
    Finished(String),

    #[error("{0}")]
    Other(String),
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
