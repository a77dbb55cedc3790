//! Configuration parsing for the quay runner and its feeds.
//!
//! Everything is read from a single JSON file. The top level holds logging
//! metadata and an `exchanges` array; each exchange entry has an optional REST
//! block (base URL, timeout, rate limit, standard headers) and any number of
//! socket streams.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "module_name": "quay", "log_path": "/tmp/quay" },
//!   "exchanges": [{
//!     "name": "demo",
//!     "rest": { "base_url": "https://api.example.com", "rate_limit": { "capacity": 10, "window_ms": 1000 } },
//!     "streams": [{ "label": "demo_books", "endpoints": ["wss://stream.example.com/ws"] }]
//!   }]
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::QuayError;
use crate::types::DeliveryMode;
use crate::ws::{PingPayload, SessionConfig};

/// Longest rate-limit window accepted from configuration.
pub const MAX_RATE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// One entry per exchange the runner talks to.
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

/// Logging block.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log file prefix.
    #[serde(default = "default_module_name")]
    pub module_name: String,

    /// Directory for daily-rotating log files. Console only when absent.
    #[serde(default)]
    pub log_path: Option<String>,

    /// Default level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            module_name: default_module_name(),
            log_path: None,
            level: default_log_level(),
            json: false,
        }
    }
}

/// A single exchange: one REST surface and any number of socket streams.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange identifier, used in log prefixes.
    pub name: String,

    #[serde(default)]
    pub rest: Option<RestConfig>,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// REST executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    /// Base URL all request paths are joined onto.
    pub base_url: String,

    /// Hard per-request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Extra headers added to every request before signing.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,

    /// Unauthenticated GET path the runner calls at startup, if set.
    #[serde(default)]
    pub probe_path: Option<String>,
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Sliding-window rate limit: `capacity` calls per `window_ms`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            window_ms: default_rate_window_ms(),
        }
    }
}

/// One logical socket subscription, possibly spread over several endpoints
/// (e.g. one socket per market).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Human-readable label (e.g. `"demo_books"`).
    pub label: String,

    /// WebSocket URLs; one session is opened per entry.
    pub endpoints: Vec<String>,

    /// Message sent on every session right after the handshake.
    #[serde(default)]
    pub subscribe_msg: Option<String>,

    /// Keepalive ping interval in milliseconds (0 disables).
    #[serde(default)]
    pub keep_alive_ms: u64,

    /// Liveness deadline in milliseconds; defaults to three keepalive intervals.
    #[serde(default)]
    pub keep_alive_timeout_ms: Option<u64>,

    #[serde(default)]
    pub ping: Option<PingPayload>,

    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    /// Keep at most this many levels per side.
    #[serde(default)]
    pub max_depth: Option<usize>,

    /// Extra HTTP headers for the handshake.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl StreamConfig {
    /// Build the session config for endpoint `idx`.
    pub fn session_config(&self, idx: usize) -> Option<SessionConfig> {
        let url = self.endpoints.get(idx)?;
        let keep_alive = Duration::from_millis(self.keep_alive_ms);
        Some(SessionConfig {
            id: idx,
            url: url.clone(),
            subscribe_msg: self.subscribe_msg.clone(),
            extra_headers: self.extra_headers.clone(),
            keep_alive,
            keep_alive_timeout: self.keep_alive_timeout_ms.map(Duration::from_millis),
            ping_payload: self.ping.clone(),
        })
    }

    /// Session configs for every endpoint, ids `0..n`.
    pub fn session_configs(&self) -> Vec<SessionConfig> {
        (0..self.endpoints.len()).filter_map(|i| self.session_config(i)).collect()
    }
}

impl AppConfig {
    /// Reject values that would make the gate, executor, or feeds unusable.
    pub fn validate(&self) -> Result<(), QuayError> {
        for ex in &self.exchanges {
            if let Some(rest) = &ex.rest {
                if rest.base_url.is_empty() {
                    return Err(QuayError::Config(format!("{}: rest.base_url is empty", ex.name)));
                }
                if rest.timeout_ms == 0 {
                    return Err(QuayError::Config(format!("{}: rest.timeout_ms must be > 0", ex.name)));
                }
                if rest.rate_limit.capacity == 0 {
                    return Err(QuayError::Config(format!(
                        "{}: rate_limit.capacity must be > 0",
                        ex.name
                    )));
                }
                let window = rest.rate_limit.window();
                if window.is_zero() || window > MAX_RATE_WINDOW {
                    return Err(QuayError::Config(format!(
                        "{}: rate_limit.window_ms must be in 1..={}",
                        ex.name,
                        MAX_RATE_WINDOW.as_millis()
                    )));
                }
            }
            for stream in &ex.streams {
                if stream.endpoints.is_empty() {
                    return Err(QuayError::Config(format!(
                        "{}/{}: stream has no endpoints",
                        ex.name, stream.label
                    )));
                }
                if stream.max_depth == Some(0) {
                    return Err(QuayError::Config(format!(
                        "{}/{}: max_depth must be > 0",
                        ex.name, stream.label
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load, parse, and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_module_name() -> String {
    "quay".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    concat!("quay/", env!("CARGO_PKG_VERSION")).into()
}

fn default_content_type() -> String {
    "application/x-www-form-urlencoded".into()
}

fn default_accept_language() -> String {
    "en-US,en;q=0.5".into()
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_rate_window_ms() -> u64 {
    1_000
}
