//! # linekv-client
//!
//! Async client library for LineKV.
//!
//! This crate provides:
//! - Connection management over plain TCP or TLS, with automatic
//!   reconnection and an optional keep-alive ping
//! - A single-flight dispatcher with per-command timeouts
//! - Typed result decoding for the standard command set
//! - A parallel batch executor for large command sets

pub mod batch;
pub mod client;
pub mod connection;
pub mod error;
pub mod reply;
pub mod stream;
pub mod tls;

pub use batch::{HashEntry, BATCH_CHUNK_SIZE};
pub use client::Client;
pub use connection::{Connection, ConnectionConfig, TlsConfig};
pub use error::ClientError;
pub use linekv_protocol::Arg;
pub use reply::Reply;

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Enables verbose per-command logging process-wide.
///
/// Meant to be flipped once at startup; every other site only reads it.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
    if enabled {
        tracing::info!("verbose command logging enabled");
    }
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}
