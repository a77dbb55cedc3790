//! # quay-runner
//!
//! Main entry point for the quay substrate.
//!
//! Loads a JSON configuration file, probes each exchange's REST surface
//! through a rate-gated executor, starts one market feed per configured
//! stream, and keeps them running until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! quay-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use quay_core::config::RestConfig;
use quay_md::{BookStore, CanonicalJsonParser, FeedEvent, MarketFeed, MessageParser};
use quay_rest::RequestExecutor;
use quay_rest::RestCall;
use quay_rest::observer::{LatencyObserver, LoggingObserver};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Multi-exchange market data runner.
#[derive(Parser)]
#[command(name = "quay-runner", about = "Multi-exchange market data runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output; overrides the config file.
    #[arg(long)]
    log_dir: Option<String>,

    /// Skip the startup REST probes.
    #[arg(long)]
    no_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (logging settings live in it)
    let mut config = quay_core::config::load_config(&cli.config)?;
    if let Some(dir) = cli.log_dir {
        config.logging.log_path = Some(dir);
    }

    // 2. Initialize logging; the guard flushes file output on exit
    let _guard = quay_core::logging::init_logging(&config.logging, cli.log_level.as_deref())?;
    info!(
        "quay-runner starting, config={}, {} exchange(s)",
        cli.config.display(),
        config.exchanges.len()
    );

    // 3. Probe REST surfaces
    if !cli.no_probe {
        for exchange in &config.exchanges {
            let Some(rest) = &exchange.rest else { continue };
            let Some(path) = rest.probe_path.as_deref() else { continue };
            probe(&exchange.name, rest, path).await;
        }
    }

    // 4. Start one feed per stream, all publishing into one store
    let store = BookStore::new();
    let parser: Arc<dyn MessageParser> = Arc::new(CanonicalJsonParser);
    let mut feeds = Vec::new();
    let mut loggers = Vec::new();

    for exchange in &config.exchanges {
        for stream in &exchange.streams {
            let name = format!("{}/{}", exchange.name, stream.label);
            let mut feed = MarketFeed::new(stream.clone(), Arc::clone(&parser), store.clone());
            match feed.start() {
                Ok(events) => {
                    loggers.push(tokio::spawn(log_events(name, events, store.clone())));
                    feeds.push(feed);
                }
                Err(e) => error!("[{name}] failed to start: {e}"),
            }
        }
    }

    info!("{} feed(s) started, press Ctrl+C to stop", feeds.len());

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 6. Stop feeds; loggers end once their feed is gone
    for feed in &mut feeds {
        info!("stopping feed '{}'", feed.label());
        feed.stop().await;
    }
    for logger in loggers {
        let _ = logger.await;
    }

    info!("all feeds stopped");
    Ok(())
}

/// One unauthenticated GET through a fresh executor, with latency logged.
async fn probe(exchange: &str, rest: &RestConfig, path: &str) {
    let latency = Arc::new(LatencyObserver::new());
    let executor = RequestExecutor::builder_from_config(rest)
        .and_then(|b| b.observer(Arc::new(LoggingObserver)).observer(latency.clone()).build());
    let executor = match executor {
        Ok(ex) => ex,
        Err(e) => {
            error!("[{exchange}] cannot build REST executor: {e}");
            return;
        }
    };

    match executor.execute(RestCall::get(path)).await {
        Ok(resp) => info!("[{exchange}] probe {path}: HTTP {} ({} bytes)", resp.status, resp.body.len()),
        Err(e) => warn!("[{exchange}] probe {path} failed: {e}"),
    }
    if let Some(stats) = latency.stats() {
        info!("[{exchange}] probe latency {stats}");
    }
}

async fn log_events(name: String, mut events: mpsc::UnboundedReceiver<FeedEvent>, store: BookStore) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Connected => info!("[{name}] connected"),
            FeedEvent::Disconnected { member, reason } => warn!("[{name}] member {member} dropped: {reason}"),
            FeedEvent::Book { symbol, outcome } => {
                if outcome.skipped() > 0 {
                    warn!("[{name}] {symbol}: {} invalid level(s) skipped", outcome.skipped());
                }
                if let Some(book) = store.snapshot(&symbol) {
                    debug!("[{name}] {book}");
                }
            }
            FeedEvent::Trades { symbol, trades } => {
                for t in &trades {
                    debug!("[{name}] {symbol} trade {} {:?} {}@{}", t.trade_id, t.taker_side, t.quantity, t.price);
                }
            }
            FeedEvent::Desync { symbol, expected, received } => {
                warn!("[{name}] {symbol} sequence gap: expected {expected}, got {received}")
            }
            FeedEvent::ParseError { member, error } => warn!("[{name}] member {member} bad frame: {error}"),
        }
    }
}
