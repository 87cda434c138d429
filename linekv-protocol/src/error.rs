//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or parsing wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot encode argument: {0}")]
    Encode(String),

    #[error("invalid part length {0:?}")]
    Length(String),

    #[error("invalid UTF-8 in part")]
    InvalidUtf8,

    #[error("compressed frame is missing its payload part")]
    MissingPayload,

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated compressed frame")]
    Truncated,
}
