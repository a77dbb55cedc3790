//! Enumerations used throughout the quay substrate.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Book side
// ---------------------------------------------------------------------------

/// Order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

// ---------------------------------------------------------------------------
// Taker side of a trade
// ---------------------------------------------------------------------------

/// Aggressor side of a public trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Buy,
    Sell,
    #[default]
    Unknown,
}

// ---------------------------------------------------------------------------
// Delivery mode
// ---------------------------------------------------------------------------

/// How an exchange delivers order book data over its socket.
///
/// This is configuration, fixed for the life of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every message is a complete replacement of the book.
    FullBookAlways,
    /// Every message is an incremental change; no snapshot ever arrives.
    DeltasOnly,
    /// The first message is a snapshot, later messages are deltas.
    #[default]
    FullBookFirstThenDeltas,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullBookAlways => write!(f, "full_book_always"),
            Self::DeltasOnly => write!(f, "deltas_only"),
            Self::FullBookFirstThenDeltas => write!(f, "full_book_first_then_deltas"),
        }
    }
}

// ---------------------------------------------------------------------------
// Record kind
// ---------------------------------------------------------------------------

/// Discriminant for the records carried by a parsed socket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    OrderBook,
    Trades,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_uses_snake_case() {
        let mode: DeliveryMode = serde_json::from_str("\"deltas_only\"").unwrap();
        assert_eq!(mode, DeliveryMode::DeltasOnly);
        assert_eq!(
            serde_json::to_string(&DeliveryMode::FullBookAlways).unwrap(),
            "\"full_book_always\""
        );
        assert_eq!(DeliveryMode::default(), DeliveryMode::FullBookFirstThenDeltas);
    }
}
