//! Client error types.
//!
//! Every failure surfaced by the client is one [`RpcError`], classified into
//! four kinds by [`RpcError::kind`]:
//!
//! - **Transport** — setup failed, connection closed, network fault,
//!   reconnect exhausted, heartbeat timeout
//! - **Protocol** — the server answered with a JSON-RPC error object
//! - **Coding** — a request could not be encoded or a response did not
//!   match the expected shape
//! - **Usage** — contract violations and expected races: duplicate
//!   handlers, cancellation, timeouts, wrong method kind

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Coding,
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Protocol => write!(f, "protocol"),
            Self::Coding => write!(f, "coding"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// Errors that can occur while talking to an Electrum-protocol server.
///
/// `Clone` so a single failure can be fanned out to every pending waiter.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The socket could not be opened.
    #[error("connection setup to {url} failed: {reason}")]
    SetupFailed { url: String, reason: String },

    /// The connection was closed, by the peer or locally.
    #[error("connection closed (code {}): {reason}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// Low-level send/receive failure.
    #[error("network error: {0}")]
    Network(String),

    /// No live connection to send on.
    #[error("not connected")]
    NotConnected,

    /// Every reconnect attempt failed.
    #[error("reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Heartbeat misses exceeded tolerance and reconnection failed.
    #[error("heartbeat timed out after {misses} missed pings")]
    HeartbeatTimeout { misses: u32 },

    /// JSON-RPC error object returned by the server.
    #[error("RPC error {code}: {message}")]
    Rpc {
        id: Option<String>,
        code: i64,
        message: String,
    },

    /// No protocol version is supported by both sides.
    #[error("no common protocol version (client {client}, server {server})")]
    IncompatibleProtocol { client: String, server: String },

    /// The request could not be encoded.
    #[error("failed to encode {method}: {reason}")]
    Encode { method: String, reason: String },

    /// The response did not match the expected shape.
    #[error("failed to decode {method} response ({payload_bytes} bytes): {reason}")]
    Decode {
        method: String,
        payload_bytes: usize,
        reason: String,
    },

    /// A waiter is already registered under this correlation key.
    #[error("duplicate handler for {key}")]
    DuplicateHandler { key: String },

    /// The caller abandoned the request.
    #[error("request cancelled")]
    Cancelled,

    /// The server answered with neither `result` nor `error`.
    #[error("empty response for {method}")]
    EmptyResponse { method: String },

    /// `call` on a subscription method or `subscribe` on a unary one.
    #[error("{method} is not a {expected} method")]
    UnexpectedMethodKind {
        method: String,
        expected: &'static str,
    },

    /// Request timed out after the configured duration.
    #[error("request timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Invalid configuration or server catalogue.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpcError {
    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SetupFailed { .. }
            | Self::ConnectionClosed { .. }
            | Self::Network(_)
            | Self::NotConnected
            | Self::ReconnectExhausted { .. }
            | Self::HeartbeatTimeout { .. } => ErrorKind::Transport,
            Self::Rpc { .. } | Self::IncompatibleProtocol { .. } => ErrorKind::Protocol,
            Self::Encode { .. } | Self::Decode { .. } => ErrorKind::Coding,
            Self::DuplicateHandler { .. }
            | Self::Cancelled
            | Self::EmptyResponse { .. }
            | Self::UnexpectedMethodKind { .. }
            | Self::Timeout { .. }
            | Self::InvalidConfig(_) => ErrorKind::Usage,
        }
    }

    /// Returns `true` if reconnecting could fix this error.
    ///
    /// Server-returned RPC errors and coding failures are never retryable:
    /// resending the same bytes yields the same answer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SetupFailed { .. }
                | Self::ConnectionClosed { .. }
                | Self::Network(_)
                | Self::NotConnected
        )
    }

    /// Returns `true` if this is an error object returned by the server.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;
