//! Request parameters and nonces.
//!
//! [`Payload`] keeps parameters in insertion order, because several exchanges
//! sign the exact query string the client sends. It renders either as a
//! URL-encoded query/form string or as a JSON object.

use std::sync::atomic::{AtomicU64, Ordering};

use quay_core::time_util;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Key used for nonces in authenticated calls.
pub const NONCE_KEY: &str = "nonce";

/// Insertion-ordered parameter map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    entries: Vec<(String, Value)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set the `nonce` parameter from `generator`.
    pub fn with_nonce(self, generator: &NonceGenerator) -> Self {
        self.with(NONCE_KEY, generator.next())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn nonce(&self) -> Option<&Value> {
        self.get(NONCE_KEY)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `k1=v1&k2=v2`, URL-encoded, in insertion order.
    pub fn to_query_string(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(&scalar_text(v))))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// JSON object text, keys in insertion order.
    pub fn to_json_body(&self) -> String {
        // Serializing a Vec of string-keyed pairs cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut payload = Payload::new();
        for (k, v) in iter {
            payload.insert(k, v);
        }
        payload
    }
}

/// Query-string form of a JSON value: strings unquoted, null empty.
fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// How nonces are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStyle {
    UnixMillis,
    UnixMicros,
    UnixSeconds,
    /// 1, 2, 3, ...
    Counter,
}

/// Strictly increasing nonce source, safe to share between tasks.
///
/// Clock-based styles never repeat or go backwards: two calls within the same
/// clock tick, or a clock step back, yield `previous + 1`.
#[derive(Debug)]
pub struct NonceGenerator {
    style: NonceStyle,
    last: AtomicU64,
}

impl NonceGenerator {
    pub fn new(style: NonceStyle) -> Self {
        Self { style, last: AtomicU64::new(0) }
    }

    pub fn style(&self) -> NonceStyle {
        self.style
    }

    pub fn next(&self) -> u64 {
        let candidate = match self.style {
            NonceStyle::UnixMillis => time_util::now_ms(),
            NonceStyle::UnixMicros => time_util::now_us(),
            NonceStyle::UnixSeconds => time_util::now_secs(),
            NonceStyle::Counter => 0,
        };
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(candidate.max(prev + 1)))
            .unwrap_or_else(|prev| prev);
        candidate.max(prev + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn insert_keeps_first_position() {
        let mut p = Payload::new();
        p.insert("symbol", "BTC-USD").insert("qty", 2).insert("symbol", "ETH-USD");
        assert_eq!(p.len(), 2);
        assert_eq!(p.to_query_string(), "symbol=ETH-USD&qty=2");
    }

    #[test]
    fn query_string_encodes() {
        let p = Payload::new().with("note", "a b&c").with("flag", true).with("empty", Value::Null);
        assert_eq!(p.to_query_string(), "note=a%20b%26c&flag=true&empty=");
    }

    #[test]
    fn json_body_keeps_order() {
        let p = Payload::new().with("z", 1).with("a", "x");
        assert_eq!(p.to_json_body(), r#"{"z":1,"a":"x"}"#);
        assert_eq!(Payload::new().to_json_body(), "{}");
    }

    #[test]
    fn remove_and_collect() {
        let mut p: Payload = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(p.remove("a"), Some(Value::from(1)));
        assert_eq!(p.to_query_string(), "b=2");
        assert!(p.remove("missing").is_none());
    }

    #[test]
    fn counter_nonce_counts_from_one() {
        let g = NonceGenerator::new(NonceStyle::Counter);
        assert_eq!(g.next(), 1);
        assert_eq!(g.next(), 2);
        let p = Payload::new().with_nonce(&g);
        assert_eq!(p.nonce(), Some(&Value::from(3u64)));
    }

    #[test]
    fn clock_nonce_strictly_increases() {
        let g = NonceGenerator::new(NonceStyle::UnixSeconds);
        let a = g.next();
        let b = g.next();
        assert!(b > a);
        assert!(a >= time_util::now_secs() - 1);
    }

    #[test]
    fn nonces_unique_across_threads() {
        let g = Arc::new(NonceGenerator::new(NonceStyle::UnixMillis));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || (0..500).map(|_| g.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for n in h.join().unwrap() {
                assert!(seen.insert(n), "duplicate nonce {n}");
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
