//! Typed error definitions shared by the quay crates.
//!
//! [`QuayError`] covers the failures that are not specific to the REST path
//! (which has its own taxonomy in `quay-rest`). All variants implement
//! `std::error::Error` via `thiserror`, so they compose with `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the quay substrate.
#[derive(Debug, Error)]
pub enum QuayError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket handshake or request construction error.
    #[error("websocket error: {0}")]
    WebSocket(String),
}
