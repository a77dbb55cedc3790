//! Normalized market data records.
//!
//! Exchange adapters decode raw socket frames into [`ParsedMessage`]s; the
//! order book reconciler and the trade filter consume them. Prices and
//! quantities are exact decimals so that price levels can be used as map keys.

use rust_decimal::Decimal;

use super::enums::{RecordKind, Side, TakerSide};

/// One price level change: set `side@price` to `quantity` (≤ 0 removes it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl LevelUpdate {
    pub fn bid(price: Decimal, quantity: Decimal) -> Self {
        Self { side: Side::Bid, price, quantity }
    }

    pub fn ask(price: Decimal, quantity: Decimal) -> Self {
        Self { side: Side::Ask, price, quantity }
    }
}

/// A batch of level changes for one market, as delivered by one message.
///
/// Whether the batch is a snapshot or a delta is decided by the reconciler's
/// delivery mode, not by the message itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookUpdate {
    /// Final (or only) exchange sequence number covered by this message.
    pub sequence: Option<u64>,
    /// First sequence number covered, for exchanges that send ranges.
    pub first_sequence: Option<u64>,
    /// Exchange timestamp in milliseconds, if provided.
    pub timestamp_ms: Option<u64>,
    pub levels: Vec<LevelUpdate>,
}

/// A single public trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trade {
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub taker_side: TakerSide,
    pub timestamp_ms: u64,
}

/// Records carried by one parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    Book(BookUpdate),
    Trades(Vec<Trade>),
}

/// Output of an adapter-supplied parse function: `(symbol, kind, records)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub symbol: String,
    pub records: Records,
}

impl ParsedMessage {
    pub fn book(symbol: impl Into<String>, update: BookUpdate) -> Self {
        Self { symbol: symbol.into(), records: Records::Book(update) }
    }

    pub fn trades(symbol: impl Into<String>, trades: Vec<Trade>) -> Self {
        Self { symbol: symbol.into(), records: Records::Trades(trades) }
    }

    pub fn kind(&self) -> RecordKind {
        match self.records {
            Records::Book(_) => RecordKind::OrderBook,
            Records::Trades(_) => RecordKind::Trades,
        }
    }
}

impl std::fmt::Display for ParsedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.records {
            Records::Book(b) => write!(
                f,
                "Book({} levels={} seq={:?})",
                self.symbol,
                b.levels.len(),
                b.sequence
            ),
            Records::Trades(t) => write!(f, "Trades({} n={})", self.symbol, t.len()),
        }
    }
}
