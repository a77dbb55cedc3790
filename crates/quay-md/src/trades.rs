//! Trade replay filter.
//!
//! Re-subscribing after a reconnect often replays the last few trades. The
//! filter keeps the highest trade id seen per market and drops anything at or
//! below it. Trade ids must increase per market for this to hold.

use ahash::AHashMap;
use quay_core::types::Trade;

#[derive(Debug, Default)]
pub struct TradeFilter {
    last_ids: AHashMap<String, u64>,
}

impl TradeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `trade_id` is new for `symbol`; records it when so.
    #[inline]
    pub fn check(&mut self, symbol: &str, trade_id: u64) -> bool {
        match self.last_ids.get_mut(symbol) {
            Some(last) if trade_id <= *last => false,
            Some(last) => {
                *last = trade_id;
                true
            }
            None => {
                self.last_ids.insert(symbol.to_string(), trade_id);
                true
            }
        }
    }

    /// Keep only the trades not seen before, in their original order.
    pub fn filter(&mut self, symbol: &str, trades: Vec<Trade>) -> Vec<Trade> {
        trades.into_iter().filter(|t| self.check(symbol, t.trade_id)).collect()
    }

    pub fn last_id(&self, symbol: &str) -> Option<u64> {
        self.last_ids.get(symbol).copied()
    }

    pub fn reset(&mut self, symbol: &str) {
        self.last_ids.remove(symbol);
    }

    pub fn clear(&mut self) {
        self.last_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use quay_core::types::TakerSide;
    use rust_decimal_macros::dec;

    use super::*;

    fn trade(id: u64) -> Trade {
        Trade { trade_id: id, price: dec!(1), quantity: dec!(1), taker_side: TakerSide::Buy, timestamp_ms: id }
    }

    #[test]
    fn replays_are_dropped() {
        let mut f = TradeFilter::new();
        let first = f.filter("BTC", vec![trade(1), trade(2), trade(3)]);
        assert_eq!(first.len(), 3);

        let replay = f.filter("BTC", vec![trade(2), trade(3), trade(4)]);
        assert_eq!(replay.iter().map(|t| t.trade_id).collect::<Vec<_>>(), vec![4]);
        assert_eq!(f.last_id("BTC"), Some(4));
    }

    #[test]
    fn markets_tracked_separately() {
        let mut f = TradeFilter::new();
        assert!(f.check("A", 10));
        assert!(f.check("B", 1));
        assert!(!f.check("A", 10));

        f.reset("A");
        assert!(f.check("A", 10));
        f.clear();
        assert_eq!(f.last_id("B"), None);
    }
}
