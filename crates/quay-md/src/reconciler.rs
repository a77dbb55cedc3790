//! Order book reconciliation across the three delivery modes.
//!
//! The reconciler owns one [`OrderBook`] per market and decides, for every
//! incoming [`BookUpdate`], whether it is a snapshot or a delta and whether it
//! is still fresh:
//!
//! | Mode                      | Treated as                                   | Discarded when            |
//! |---------------------------|----------------------------------------------|---------------------------|
//! | `FullBookAlways`          | snapshot                                     | `seq < last`              |
//! | `DeltasOnly`              | delta                                        | `seq <= last`             |
//! | `FullBookFirstThenDeltas` | snapshot once per (re)start, then deltas     | as above, per phase       |
//!
//! A delta whose first sequence skips past `last + 1` is still applied but
//! reported as [`ApplyOutcome::Desync`]; recovery (resubscribe or a REST
//! snapshot via [`OrderBookReconciler::seed`]) is the caller's decision.
//! Sequence checks only run when both sides of the comparison are known.

use ahash::AHashMap;
use quay_core::time_util;
use quay_core::types::{BookUpdate, DeliveryMode, ParsedMessage, Records};
use tracing::{debug, warn};

use crate::order_book::OrderBook;

/// What happened to one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Replaced the book.
    Snapshot { skipped: usize },
    /// Applied as a delta.
    Delta { skipped: usize },
    /// Applied as a delta across a sequence gap; the book may be wrong.
    Desync { expected: u64, received: u64, skipped: usize },
    /// Older than (or equal to) what the book already reflects; ignored.
    Stale { last: u64, received: u64 },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Stale { .. })
    }

    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Desync { .. })
    }

    /// Invalid levels dropped from the update.
    pub fn skipped(&self) -> usize {
        match *self {
            Self::Snapshot { skipped } | Self::Delta { skipped } | Self::Desync { skipped, .. } => skipped,
            Self::Stale { .. } => 0,
        }
    }
}

struct Market {
    book: OrderBook,
    snapshot_seen: bool,
}

/// Books for every market of one subscription.
pub struct OrderBookReconciler {
    mode: DeliveryMode,
    max_depth: Option<usize>,
    markets: AHashMap<String, Market>,
}

impl OrderBookReconciler {
    pub fn new(mode: DeliveryMode, max_depth: Option<usize>) -> Self {
        Self { mode, max_depth, markets: AHashMap::new() }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Apply one update for `symbol` according to the delivery mode.
    pub fn apply(&mut self, symbol: &str, update: &BookUpdate) -> ApplyOutcome {
        let mode = self.mode;
        let max_depth = self.max_depth;
        let market = self.market(symbol);
        let as_snapshot = match mode {
            DeliveryMode::FullBookAlways => true,
            DeliveryMode::DeltasOnly => false,
            DeliveryMode::FullBookFirstThenDeltas => !market.snapshot_seen,
        };

        let outcome = if as_snapshot {
            if mode == DeliveryMode::FullBookAlways {
                if let (Some(last), Some(received)) = (market.book.last_sequence(), update.sequence) {
                    if received < last {
                        return stale(symbol, last, received);
                    }
                }
            }
            let skipped = market.book.replace(&update.levels);
            market.book.set_last_sequence(update.sequence);
            market.snapshot_seen = true;
            ApplyOutcome::Snapshot { skipped }
        } else {
            let mut gap = None;
            if let Some(last) = market.book.last_sequence() {
                if let Some(received) = update.sequence {
                    if received <= last {
                        return stale(symbol, last, received);
                    }
                }
                if let Some(first) = update.first_sequence.or(update.sequence) {
                    if first > last.saturating_add(1) {
                        gap = Some((last.saturating_add(1), first));
                    }
                }
            }
            let skipped = market.book.apply_levels(&update.levels);
            if update.sequence.is_some() {
                market.book.set_last_sequence(update.sequence);
            }
            match gap {
                Some((expected, received)) => {
                    warn!("[reconciler] {symbol}: sequence gap, expected {expected} got {received}");
                    ApplyOutcome::Desync { expected, received, skipped }
                }
                None => ApplyOutcome::Delta { skipped },
            }
        };

        if let Some(depth) = max_depth {
            market.book.truncate(depth);
        }
        market.book.touch(update.timestamp_ms.unwrap_or_else(time_util::now_ms));
        if outcome.skipped() > 0 {
            debug!("[reconciler] {symbol}: skipped {} invalid level(s)", outcome.skipped());
        }
        outcome
    }

    /// Route a parsed message; `None` for non-book records.
    pub fn apply_message(&mut self, message: &ParsedMessage) -> Option<ApplyOutcome> {
        match &message.records {
            Records::Book(update) => Some(self.apply(&message.symbol, update)),
            Records::Trades(_) => None,
        }
    }

    /// Install an externally fetched snapshot (e.g. from REST) regardless of
    /// mode. Later deltas continue from its sequence.
    pub fn seed(&mut self, symbol: &str, snapshot: &BookUpdate) -> ApplyOutcome {
        let max_depth = self.max_depth;
        let market = self.market(symbol);
        let skipped = market.book.replace(&snapshot.levels);
        market.book.set_last_sequence(snapshot.sequence);
        market.snapshot_seen = true;
        if let Some(depth) = max_depth {
            market.book.truncate(depth);
        }
        market.book.touch(snapshot.timestamp_ms.unwrap_or_else(time_util::now_ms));
        ApplyOutcome::Snapshot { skipped }
    }

    /// Forget one market; its next update starts from scratch.
    pub fn reset(&mut self, symbol: &str) {
        self.markets.remove(symbol);
    }

    /// Forget every market (subscription restart).
    pub fn reset_all(&mut self) {
        self.markets.clear();
    }

    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.markets.get(symbol).map(|m| &m.book)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.markets.keys().cloned().collect()
    }

    fn market(&mut self, symbol: &str) -> &mut Market {
        self.markets
            .entry(symbol.to_string())
            .or_insert_with(|| Market { book: OrderBook::new(symbol), snapshot_seen: false })
    }
}

fn stale(symbol: &str, last: u64, received: u64) -> ApplyOutcome {
    debug!("[reconciler] {symbol}: stale update {received} (book at {last})");
    ApplyOutcome::Stale { last, received }
}
