//! Per-market price-level book.
//!
//! Prices are exact decimals and serve as map keys, so two updates for the
//! same price always land on one level (the later quantity wins).
//!
//! - Bids iterate **descending** by price (best bid first).
//! - Asks iterate **ascending** by price (best ask first).
//! - A level whose quantity drops to zero is removed, never stored.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use quay_core::types::{LevelUpdate, Side};
use rust_decimal::Decimal;

/// Result of applying one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    Upserted,
    Removed,
    /// Quantity was zero and no level existed.
    Unchanged,
    /// Non-positive price or negative quantity; the book is untouched.
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_sequence: Option<u64>,
    last_updated_ms: u64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), ..Self::default() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Replace both sides with `levels`. Returns the number of invalid levels
    /// skipped.
    pub fn replace(&mut self, levels: &[LevelUpdate]) -> usize {
        self.bids.clear();
        self.asks.clear();
        self.apply_levels(levels)
    }

    /// Set `side@price` to `quantity`; zero removes the level.
    pub fn apply_level(&mut self, side: Side, price: Decimal, quantity: Decimal) -> LevelChange {
        if price <= Decimal::ZERO || quantity < Decimal::ZERO {
            return LevelChange::Invalid;
        }
        let removing = quantity.is_zero();
        let existed = match side {
            Side::Bid if removing => self.bids.remove(&Reverse(price)).is_some(),
            Side::Ask if removing => self.asks.remove(&price).is_some(),
            Side::Bid => {
                self.bids.insert(Reverse(price), quantity);
                return LevelChange::Upserted;
            }
            Side::Ask => {
                self.asks.insert(price, quantity);
                return LevelChange::Upserted;
            }
        };
        if existed { LevelChange::Removed } else { LevelChange::Unchanged }
    }

    /// Apply levels in order. Returns the number of invalid levels skipped.
    pub fn apply_levels(&mut self, levels: &[LevelUpdate]) -> usize {
        levels
            .iter()
            .filter(|l| self.apply_level(l.side, l.price, l.quantity) == LevelChange::Invalid)
            .count()
    }

    /// `(price, quantity)` of the highest bid.
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next().map(|(Reverse(p), q)| (*p, *q))
    }

    /// `(price, quantity)` of the lowest ask.
    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.0 - self.best_bid()?.0)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_ask()?.0 + self.best_bid()?.0) / Decimal::from(2))
    }

    /// `true` when the best bid is at or above the best ask.
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some((b, _)), Some((a, _))) if b >= a)
    }

    /// Bids, best (highest) first.
    pub fn bids(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.iter().map(|(Reverse(p), q)| (*p, *q))
    }

    /// Asks, best (lowest) first.
    pub fn asks(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.iter().map(|(p, q)| (*p, *q))
    }

    /// Best `n` levels of each side as `(bids, asks)`.
    pub fn top(&self, n: usize) -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        (self.bids().take(n).collect(), self.asks().take(n).collect())
    }

    /// Drop everything beyond the best `max_depth` levels per side.
    pub fn truncate(&mut self, max_depth: usize) {
        while self.bids.len() > max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > max_depth {
            self.asks.pop_last();
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_sequence = None;
        self.last_updated_ms = 0;
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, sequence: Option<u64>) {
        self.last_sequence = sequence;
    }

    /// Exchange (or local receive) time of the last accepted update, in ms.
    pub fn last_updated_ms(&self) -> u64 {
        self.last_updated_ms
    }

    pub(crate) fn touch(&mut self, timestamp_ms: u64) {
        self.last_updated_ms = timestamp_ms;
    }
}

impl std::fmt::Display for OrderBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_side = |level: Option<(Decimal, Decimal)>| match level {
            Some((p, q)) => format!("{q}@{p}"),
            None => "-".to_string(),
        };
        write!(
            f,
            "{} bid={} ask={} depth={}/{} seq={:?}",
            self.symbol,
            fmt_side(self.best_bid()),
            fmt_side(self.best_ask()),
            self.bids.len(),
            self.asks.len(),
            self.last_sequence
        )
    }
}
