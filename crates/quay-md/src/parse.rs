//! Frame parsing seam and the canonical JSON format.
//!
//! Exchange adapters plug a [`MessageParser`] into a feed; it turns raw frame
//! bytes into normalized [`ParsedMessage`]s. Frames the parser does not care
//! about (heartbeats, acks) should yield an empty vec, not an error.
//!
//! [`CanonicalJsonParser`] reads the exchange-neutral format used by the
//! runner and by tests:
//!
//! ```json
//! {"symbol":"BTC-USD","type":"book","seq":42,"first_seq":40,"ts":1700000000000,
//!  "bids":[["100.5","2"]],"asks":[[101,"0"]]}
//! {"symbol":"BTC-USD","type":"trades",
//!  "trades":[{"id":7,"price":"100.6","qty":"0.1","side":"buy","ts":1700000000001}]}
//! ```
//!
//! A frame may also hold a JSON array of such objects. Numbers may be JSON
//! numbers or numeric strings.

use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use quay_core::types::{BookUpdate, LevelUpdate, ParsedMessage, Side, TakerSide, Trade};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::debug;

/// Decodes one socket frame.
pub trait MessageParser: Send + Sync {
    fn parse(&self, frame: &[u8]) -> Result<Vec<ParsedMessage>>;
}

impl<F> MessageParser for F
where
    F: Fn(&[u8]) -> Result<Vec<ParsedMessage>> + Send + Sync,
{
    fn parse(&self, frame: &[u8]) -> Result<Vec<ParsedMessage>> {
        self(frame)
    }
}

/// Parse a JSON value (string or number) as an exact decimal.
///
/// Handles the common exchange pattern where numeric values may be encoded
/// as either JSON strings (`"30000.5"`) or native numbers (`30000.5`).
pub fn parse_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => decimal_from_str(s.trim()),
        Value::Number(n) => decimal_from_str(&n.to_string()),
        _ => None,
    }
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    if s.contains(['e', 'E']) {
        Decimal::from_scientific(s).ok()
    } else {
        Decimal::from_str(s).ok()
    }
}

/// Parse a JSON value (string or number) as `u64`.
pub fn parse_u64(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Parser for the canonical JSON format described in the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalJsonParser;

impl MessageParser for CanonicalJsonParser {
    fn parse(&self, frame: &[u8]) -> Result<Vec<ParsedMessage>> {
        let root: Value = serde_json::from_slice(frame).context("frame is not JSON")?;
        match root {
            Value::Array(items) => items.iter().map(parse_object).collect(),
            obj @ Value::Object(_) => Ok(vec![parse_object(&obj)?]),
            other => bail!("expected object or array, got {other}"),
        }
    }
}

fn parse_object(v: &Value) -> Result<ParsedMessage> {
    let symbol = v
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing symbol"))?;
    let kind = v.get("type").and_then(Value::as_str).ok_or_else(|| anyhow!("missing type"))?;
    let ts = v.get("ts").and_then(parse_u64);

    match kind {
        "book" => {
            let mut levels = Vec::new();
            push_levels(&mut levels, Side::Bid, v.get("bids"));
            push_levels(&mut levels, Side::Ask, v.get("asks"));
            let update = BookUpdate {
                sequence: v.get("seq").and_then(parse_u64),
                first_sequence: v.get("first_seq").and_then(parse_u64),
                timestamp_ms: ts,
                levels,
            };
            Ok(ParsedMessage::book(symbol, update))
        }
        "trades" => {
            let trades = v
                .get("trades")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|t| parse_trade(t, ts)).collect())
                .unwrap_or_default();
            Ok(ParsedMessage::trades(symbol, trades))
        }
        other => bail!("unknown message type {other:?}"),
    }
}

/// Append `[[price, qty], ...]` levels; malformed entries are dropped.
fn push_levels(out: &mut Vec<LevelUpdate>, side: Side, raw: Option<&Value>) {
    let Some(arr) = raw.and_then(Value::as_array) else {
        return;
    };
    for level in arr {
        let pair = level.as_array().and_then(|l| Some((parse_decimal(l.first()?)?, parse_decimal(l.get(1)?)?)));
        match pair {
            Some((price, quantity)) => out.push(LevelUpdate { side, price, quantity }),
            None => debug!("[parse] dropping malformed {side} level {level}"),
        }
    }
}

fn parse_trade(v: &Value, default_ts: Option<u64>) -> Option<Trade> {
    let taker_side = match v.get("side").and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
        Some("buy") | Some("b") => TakerSide::Buy,
        Some("sell") | Some("s") => TakerSide::Sell,
        _ => TakerSide::Unknown,
    };
    Some(Trade {
        trade_id: parse_u64(v.get("id")?)?,
        price: parse_decimal(v.get("price")?)?,
        quantity: parse_decimal(v.get("qty")?)?,
        taker_side,
        timestamp_ms: v.get("ts").and_then(parse_u64).or(default_ts).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use quay_core::types::{RecordKind, Records};
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;

    #[test]
    fn decimals_from_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("30000.50")), Some(dec!(30000.50)));
        assert_eq!(parse_decimal(&json!(0.1)), Some(dec!(0.1)));
        assert_eq!(parse_decimal(&json!(42)), Some(dec!(42)));
        assert_eq!(parse_decimal(&json!("1e-3")), Some(dec!(0.001)));
        assert_eq!(parse_decimal(&json!("abc")), None);
        assert_eq!(parse_decimal(&Value::Null), None);
    }

    #[test]
    fn u64_from_strings_and_numbers() {
        assert_eq!(parse_u64(&json!("17")), Some(17));
        assert_eq!(parse_u64(&json!(17)), Some(17));
        assert_eq!(parse_u64(&json!(-1)), None);
    }

    #[test]
    fn parses_book_message() {
        let raw = br#"{"symbol":"BTC-USD","type":"book","seq":"42","first_seq":40,"ts":5,
                       "bids":[["100.5","2"],["bad"]],"asks":[[101,"0"]]}"#;
        let msgs = CanonicalJsonParser.parse(raw).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), RecordKind::OrderBook);

        let Records::Book(update) = &msgs[0].records else { panic!("not a book") };
        assert_eq!(update.sequence, Some(42));
        assert_eq!(update.first_sequence, Some(40));
        assert_eq!(update.timestamp_ms, Some(5));
        assert_eq!(
            update.levels,
            vec![LevelUpdate::bid(dec!(100.5), dec!(2)), LevelUpdate::ask(dec!(101), dec!(0))]
        );
    }

    #[test]
    fn parses_trade_array_frame() {
        let raw = br#"[{"symbol":"ETH-USD","type":"trades","ts":9,
                        "trades":[{"id":7,"price":"10","qty":"0.5","side":"SELL"},
                                  {"id":"8","price":10.5,"qty":1,"side":"buy","ts":11},
                                  {"price":"1","qty":"1"}]}]"#;
        let msgs = CanonicalJsonParser.parse(raw).unwrap();
        let Records::Trades(trades) = &msgs[0].records else { panic!("not trades") };
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].taker_side, TakerSide::Sell);
        assert_eq!(trades[0].timestamp_ms, 9);
        assert_eq!(trades[1].trade_id, 8);
        assert_eq!(trades[1].timestamp_ms, 11);
    }

    #[test]
    fn rejects_unusable_frames() {
        assert!(CanonicalJsonParser.parse(b"not json").is_err());
        assert!(CanonicalJsonParser.parse(br#"{"type":"book"}"#).is_err());
        assert!(CanonicalJsonParser.parse(br#"{"symbol":"X","type":"ticker"}"#).is_err());
        assert!(CanonicalJsonParser.parse(b"42").is_err());
    }

    #[test]
    fn closures_are_parsers() {
        let parser = |_frame: &[u8]| -> Result<Vec<ParsedMessage>> { Ok(Vec::new()) };
        assert!(parser.parse(b"anything").unwrap().is_empty());
    }
}
