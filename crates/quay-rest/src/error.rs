//! REST failure taxonomy.
//!
//! Every error is returned synchronously from the call that caused it; the
//! executor never retries. Exchange-level rejections keep the raw body so
//! adapters can decode their own error codes.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    /// No rate-limit permit was granted within the caller's wait budget.
    #[error("rate limit: no permit within the allowed wait")]
    RateLimitTimeout,

    /// The request did not complete before its deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Connection, TLS, or protocol failure, surfaced as-is.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Non-success status with a body (usually the exchange's error payload).
    #[error("api error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// Non-success status with an empty body.
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Bad executor or gate parameters.
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The request sign hook failed.
    #[error("signing failed: {0:#}")]
    Sign(anyhow::Error),

    /// The rate gate was closed while waiting.
    #[error("rate gate closed")]
    Closed,
}

impl RestError {
    /// HTTP status for `Api` and `Status` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Status { status } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The request was sent and its deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout(_))
    }

    /// The gate refused admission; nothing was sent.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitTimeout)
    }
}
