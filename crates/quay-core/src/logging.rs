//! Logging initialization using the `tracing` ecosystem.
//!
//! Provides:
//! - Console output (colored and human-readable, or JSON lines)
//! - File output (daily rotation via `tracing-appender`, non-blocking writer)
//! - Configurable log level via env var `RUST_LOG` or the config file

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LoggingConfig;
use crate::error::QuayError;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start. When a log directory is configured
/// the returned [`WorkerGuard`] flushes the file writer on drop, so the caller
/// must keep it alive for the lifetime of the process.
///
/// `level_override` (e.g. from the command line) wins over `config.level`;
/// `RUST_LOG` wins over both.
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<&str>,
) -> Result<Option<WorkerGuard>, QuayError> {
    let level = level_override.unwrap_or(&config.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    let console = if config.json {
        fmt::layer().json().with_target(true).with_thread_ids(true).boxed()
    } else {
        fmt::layer().with_target(true).with_thread_ids(true).with_ansi(true).boxed()
    };
    layers.push(console);

    let mut guard = None;
    if let Some(dir) = config.log_path.as_deref() {
        let appender = tracing_appender::rolling::daily(dir, &config.module_name);
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);

        let file = if config.json {
            fmt::layer().json().with_writer(writer).with_target(true).boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .boxed()
        };
        layers.push(file);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| QuayError::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
