//! # Error Types
//!
//! Semantic error types for the hub client. Every variant carries enough
//! context to diagnose the problem from a single log line.
//!
//! ## Failure Classes
//!
//! The connection supervisor sorts failures into three buckets:
//!
//! | Class | Helper | Supervisor reaction |
//! |-------|--------|---------------------|
//! | Transient connectivity | [`HubError::is_transient`] | wait the retry delay, try again |
//! | Authentication | [`HubError::is_auth_failure`] | governed by [`AuthFailurePolicy`](crate::config::AuthFailurePolicy) |
//! | Cancellation | [`HubError::is_cancellation`] | exit silently |
//!
//! Everything else is treated as unexpected and stops the retry loop.

use thiserror::Error;

/// Convenient Result alias for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// All errors that can occur while talking to the event hub.
#[derive(Error, Debug)]
pub enum HubError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish a WebSocket connection to the hub.
    #[error("Failed to connect to hub at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// WebSocket connection was lost after being established.
    #[error("Connection to hub lost: {reason}")]
    ConnectionLost { reason: String },

    /// No live connection is available for the requested call.
    #[error("Not connected to hub")]
    NotConnected,

    /// The hub refused the protocol handshake.
    #[error("Hub rejected the protocol handshake: {reason}")]
    HandshakeRejected { reason: String },

    // ─── Authentication ─────────────────────────────────────────────
    /// The token endpoint (or the hub upgrade) answered with a non-success status.
    #[error("Authentication failed with HTTP {status}: {reason}")]
    AuthenticationFailed { status: u16, reason: String },

    /// The token endpoint answered 2xx but the body did not contain a token.
    #[error("Malformed token response: {reason}")]
    TokenParse { reason: String },

    // ─── Hub calls ──────────────────────────────────────────────────
    /// The hub completed an invocation with an error.
    #[error("Hub invocation '{target}' failed: {message}")]
    Invocation { target: String, message: String },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received an unexpected or malformed frame from the hub.
    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    // ─── Timeout ────────────────────────────────────────────────────
    /// An operation timed out waiting for the hub.
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    // ─── Ingestion ──────────────────────────────────────────────────
    /// The event queue no longer accepts items.
    #[error("Event queue is closed")]
    QueueClosed,

    /// An event handler failed to process an event.
    #[error("Event processing failed: {reason}")]
    Processing { reason: String },

    // ─── Lifecycle ──────────────────────────────────────────────────
    /// The operation was abandoned because shutdown was requested.
    #[error("Operation cancelled")]
    Cancelled,

    // ─── Config ─────────────────────────────────────────────────────
    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── Transport ──────────────────────────────────────────────────
    /// Low-level WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// TLS/SSL error during connection.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP transport error while calling the token endpoint.
    #[error("HTTP error: {0}")]
    Http(String),

    // ─── I/O ────────────────────────────────────────────────────────
    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Returns `true` for connectivity failures that are worth retrying
    /// after a delay (unreachable host, dropped socket, handshake timeout).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::ConnectionFailed { .. }
                | HubError::ConnectionLost { .. }
                | HubError::NotConnected
                | HubError::Timeout { .. }
                | HubError::WebSocket(_)
                | HubError::Tls(_)
                | HubError::Http(_)
                | HubError::Io(_)
        )
    }

    /// Returns `true` if the credential could not be obtained or was refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            HubError::AuthenticationFailed { .. } | HubError::TokenParse { .. }
        )
    }

    /// Returns `true` if this error only signals that shutdown was requested.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HubError::Cancelled)
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                HubError::AuthenticationFailed {
                    status: response.status().as_u16(),
                    reason: "hub refused the bearer token".into(),
                }
            }
            WsError::Io(io) => HubError::Io(io),
            WsError::Tls(tls) => HubError::Tls(tls.to_string()),
            other => HubError::WebSocket(other.to_string()),
        }
    }
}

impl From<native_tls::Error> for HubError {
    fn from(err: native_tls::Error) -> Self {
        HubError::Tls(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => HubError::AuthenticationFailed {
                status: status.as_u16(),
                reason: err.to_string(),
            },
            None => HubError::Http(err.to_string()),
        }
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for HubError {
    fn from(err: toml::de::Error) -> Self {
        HubError::ConfigError {
            reason: err.to_string(),
        }
    }
}
