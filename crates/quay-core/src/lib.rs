//! # quay-core
//!
//! Core crate for the quay exchange substrate, providing:
//!
//! - **Types** (`types`): sides, delivery modes, parsed book/trade records
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `QuayError` via thiserror
//! - **WebSocket** (`ws`): one-shot socket sessions and the multi-socket aggregator
//! - **Time utilities** (`time_util`): wall-clock timestamps for nonces and books
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
