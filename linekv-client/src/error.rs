//! Client error types.

use linekv_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out after {0} ms")]
    Timeout(u32),

    #[error("not found")]
    NotFound,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication failed")]
    AuthFailed,

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Vec<String>),

    #[error("host {0:?} resolved to no addresses")]
    InvalidHost(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("batch queue is empty")]
    EmptyBatch,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this is the missing-key sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }
}
