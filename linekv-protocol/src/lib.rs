//! # linekv-protocol
//!
//! Wire protocol implementation for LineKV.
//!
//! This crate provides:
//! - The closed argument model used on the request path
//! - Line framing: length-prefixed parts terminated by a blank line
//! - An incremental, restartable response parser
//! - The gzip+base64 compression subpath for requests and responses

pub mod arg;
pub mod codec;
pub mod error;

pub use arg::Arg;
pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;

/// Default port for a LineKV server.
pub const DEFAULT_PORT: u16 = 8888;

/// Status token marking a successful response.
pub const STATUS_OK: &str = "ok";

/// Status token for a missing key.
pub const STATUS_NOT_FOUND: &str = "not_found";

/// First part of a compressed response frame.
pub const ZIP_TOKEN: &str = "zip";
