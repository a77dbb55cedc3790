//! Supervised market data feed.
//!
//! A [`MarketFeed`] ties the pieces together for one configured stream:
//!
//! ```text
//! endpoints ─► MultiSocketAggregator ─► parser ─► reconciler ─► BookStore
//!                                          └────► TradeFilter ─► FeedEvent::Trades
//! ```
//!
//! Sessions never reconnect themselves, so the feed does: when the aggregate
//! goes down it drops every book it built (the next message per market must
//! be a fresh snapshot in first-then-deltas mode), waits, and opens a new
//! aggregator. The wait starts at 100ms and doubles up to 30s; a successful
//! connect resets it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quay_core::config::StreamConfig;
use quay_core::error::QuayError;
use quay_core::types::{ParsedMessage, Records, Trade};
use quay_core::ws::{AggregateEvent, DisconnectReason, Frame, MultiSocketAggregator, OnFrameCallback};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::book_store::BookStore;
use crate::parse::MessageParser;
use crate::reconciler::{ApplyOutcome, OrderBookReconciler};
use crate::trades::TradeFilter;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Everything a feed reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Every endpoint is connected.
    Connected,
    /// The aggregate dropped; a reconnect follows unless the feed is stopping.
    Disconnected { member: usize, reason: DisconnectReason },
    /// A book update was processed (applied or discarded as stale).
    Book { symbol: String, outcome: ApplyOutcome },
    /// New trades, replays removed.
    Trades { symbol: String, trades: Vec<Trade> },
    /// A delta skipped sequence numbers; the book may be wrong until the
    /// next snapshot.
    Desync { symbol: String, expected: u64, received: u64 },
    /// A frame could not be parsed and was skipped.
    ParseError { member: usize, error: String },
}

/// State shared between the supervisor task and the frame callback.
struct FeedShared {
    label: String,
    parser: Arc<dyn MessageParser>,
    reconciler: Mutex<OrderBookReconciler>,
    trades: Mutex<TradeFilter>,
    store: BookStore,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedShared {
    fn on_frame(&self, member: usize, frame: Frame<'_>) -> anyhow::Result<()> {
        let messages = match self.parser.parse(frame.as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                let _ = self.events.send(FeedEvent::ParseError { member, error: format!("{e:#}") });
                return Err(e);
            }
        };
        for message in messages {
            self.route(message);
        }
        Ok(())
    }

    fn route(&self, message: ParsedMessage) {
        let ParsedMessage { symbol, records } = message;
        match records {
            Records::Book(update) => {
                let outcome = {
                    let mut reconciler = self.reconciler.lock();
                    let outcome = reconciler.apply(&symbol, &update);
                    if outcome.is_applied() {
                        if let Some(book) = reconciler.book(&symbol) {
                            self.store.publish(book);
                        }
                    }
                    outcome
                };
                if let ApplyOutcome::Desync { expected, received, .. } = outcome {
                    let _ = self.events.send(FeedEvent::Desync { symbol: symbol.clone(), expected, received });
                }
                let _ = self.events.send(FeedEvent::Book { symbol, outcome });
            }
            Records::Trades(trades) => {
                let fresh = self.trades.lock().filter(&symbol, trades);
                if !fresh.is_empty() {
                    let _ = self.events.send(FeedEvent::Trades { symbol, trades: fresh });
                }
            }
        }
    }

    /// Drop every book built on the session that just ended.
    fn reset_books(&self) {
        let mut reconciler = self.reconciler.lock();
        for symbol in reconciler.symbols() {
            self.store.remove(&symbol);
        }
        reconciler.reset_all();
    }
}

/// One configured stream, kept alive across disconnects.
pub struct MarketFeed {
    config: StreamConfig,
    parser: Arc<dyn MessageParser>,
    store: BookStore,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MarketFeed {
    pub fn new(config: StreamConfig, parser: Arc<dyn MessageParser>, store: BookStore) -> Self {
        Self { config, parser, store, shutdown: None, task: None }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn store(&self) -> &BookStore {
        &self.store
    }

    /// Start the supervisor task. Must be called from within a tokio runtime;
    /// a feed can be started once.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<FeedEvent>, QuayError> {
        if self.task.is_some() {
            return Err(QuayError::Config(format!("feed {} already started", self.config.label)));
        }
        if self.config.endpoints.is_empty() {
            return Err(QuayError::Config(format!("feed {} has no endpoints", self.config.label)));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(FeedShared {
            label: self.config.label.clone(),
            parser: Arc::clone(&self.parser),
            reconciler: Mutex::new(OrderBookReconciler::new(self.config.delivery_mode, self.config.max_depth)),
            trades: Mutex::new(TradeFilter::new()),
            store: self.store.clone(),
            events: events_tx,
        });

        info!(
            "[feed:{}] starting, {} endpoint(s), mode {}",
            self.config.label,
            self.config.endpoints.len(),
            self.config.delivery_mode
        );
        self.task = Some(tokio::spawn(supervise(self.config.clone(), shared, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        Ok(events_rx)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close every session and wait for the supervisor to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send_replace(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MarketFeed {
    fn drop(&mut self) {
        if let Some(tx) = &self.shutdown {
            tx.send_replace(true);
        }
    }
}

async fn supervise(config: StreamConfig, shared: Arc<FeedShared>, mut shutdown: watch::Receiver<bool>) {
    let label = shared.label.clone();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let on_frame: OnFrameCallback = {
            let shared = Arc::clone(&shared);
            Arc::new(move |member: usize, frame: Frame<'_>| shared.on_frame(member, frame))
        };
        let (mut aggregator, mut aggregate_events) =
            match MultiSocketAggregator::open(config.session_configs(), on_frame) {
                Ok(pair) => pair,
                Err(e) => {
                    error!("[feed:{label}] cannot open sessions: {e}");
                    break;
                }
            };

        let stopping = loop {
            tokio::select! {
                _ = shutdown.changed() => break true,
                event = aggregate_events.recv() => match event {
                    Some(AggregateEvent::Connected) => {
                        info!("[feed:{label}] connected");
                        backoff = INITIAL_BACKOFF;
                        let _ = shared.events.send(FeedEvent::Connected);
                    }
                    Some(AggregateEvent::Disconnected { member, reason }) => {
                        warn!("[feed:{label}] member {member} disconnected: {reason}");
                        let _ = shared.events.send(FeedEvent::Disconnected { member, reason });
                        break false;
                    }
                    None => break false,
                },
            }
        };

        aggregator.stop().await;
        shared.reset_books();
        if stopping {
            break;
        }

        info!("[feed:{label}] reconnecting in {backoff:?}");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    debug!("[feed:{label}] supervisor exited");
}

#[cfg(test)]
mod tests {
    use quay_core::types::{BookUpdate, DeliveryMode, LevelUpdate};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::parse::CanonicalJsonParser;

    fn shared(mode: DeliveryMode) -> (FeedShared, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = FeedShared {
            label: "test".into(),
            parser: Arc::new(CanonicalJsonParser),
            reconciler: Mutex::new(OrderBookReconciler::new(mode, None)),
            trades: Mutex::new(TradeFilter::new()),
            store: BookStore::new(),
            events: tx,
        };
        (shared, rx)
    }

    #[test]
    fn frames_flow_into_store_and_events() {
        let (shared, mut rx) = shared(DeliveryMode::DeltasOnly);
        let frame = r#"{"symbol":"BTC","type":"book","seq":1,"bids":[["10","1"]]}"#;
        shared.on_frame(0, Frame::Text(frame)).unwrap();

        assert_eq!(shared.store.best_bid("BTC"), Some((dec!(10), dec!(1))));
        assert_eq!(
            rx.try_recv().unwrap(),
            FeedEvent::Book { symbol: "BTC".into(), outcome: ApplyOutcome::Delta { skipped: 0 } }
        );
    }

    #[test]
    fn gaps_raise_desync_events() {
        let (shared, mut rx) = shared(DeliveryMode::DeltasOnly);
        shared.route(ParsedMessage::book("BTC", BookUpdate { sequence: Some(1), ..Default::default() }));
        shared.route(ParsedMessage::book(
            "BTC",
            BookUpdate { sequence: Some(4), levels: vec![LevelUpdate::ask(dec!(5), dec!(1))], ..Default::default() },
        ));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&FeedEvent::Desync { symbol: "BTC".into(), expected: 2, received: 4 }));
    }

    #[test]
    fn parse_failures_are_reported_and_returned() {
        let (shared, mut rx) = shared(DeliveryMode::DeltasOnly);
        assert!(shared.on_frame(3, Frame::Text("{oops")).is_err());
        assert!(matches!(rx.try_recv().unwrap(), FeedEvent::ParseError { member: 3, .. }));
    }

    #[test]
    fn reset_clears_books_everywhere() {
        let (shared, _rx) = shared(DeliveryMode::FullBookFirstThenDeltas);
        shared.route(ParsedMessage::book(
            "ETH",
            BookUpdate { levels: vec![LevelUpdate::bid(dec!(1), dec!(1))], ..Default::default() },
        ));
        assert!(shared.store.snapshot("ETH").is_some());

        shared.reset_books();
        assert!(shared.store.snapshot("ETH").is_none());
        assert!(shared.reconciler.lock().book("ETH").is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"label":"x","endpoints":["ws://127.0.0.1:9/ws"]}"#).unwrap();
        let mut feed = MarketFeed::new(config, Arc::new(CanonicalJsonParser), BookStore::new());
        let _events = feed.start().unwrap();
        assert!(feed.start().is_err());
        feed.stop().await;
        assert!(!feed.is_running());
    }
}
