use std::time::Duration;

use thiserror::Error;

/// Unified error type for transport-layer failures on both the client and
/// server side.
///
/// Dispatcher-level failures are not represented here; they stay inside the
/// dispatcher task and only cause the owning session to be disposed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("SSE error: {0}")]
    Sse(#[from] sse_stream::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid endpoint {0:?}: only http and https are supported")]
    InvalidEndpoint(String),
    #[error("unexpected server status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("event stream ended before the endpoint event")]
    MissingEndpointEvent,
    #[error("missing session id")]
    MissingSessionId,
    #[error("failed to establish connection: {0}")]
    ConnectionFailed(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcome of resolving a session id presented by a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionAccessError {
    #[error("session not found")]
    NotFound,
    #[error("session user mismatch")]
    UserMismatch,
}
