//! Shared, read-mostly view of the latest books.
//!
//! The reconciler lives behind the feed's mutex; other threads read from a
//! [`BookStore`] instead. Every accepted update publishes a copy of the book,
//! so readers always see a consistent snapshot and never block the feed for
//! longer than one map insert.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::order_book::OrderBook;

/// Cloneable handle; all clones share one map.
#[derive(Clone, Default)]
pub struct BookStore {
    books: Arc<RwLock<AHashMap<String, OrderBook>>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored copy of `book`'s market.
    pub fn publish(&self, book: &OrderBook) {
        let mut books = self.books.write();
        match books.get_mut(book.symbol()) {
            Some(slot) => slot.clone_from(book),
            None => {
                books.insert(book.symbol().to_string(), book.clone());
            }
        }
    }

    /// Copy of the latest book for `symbol`.
    pub fn snapshot(&self, symbol: &str) -> Option<OrderBook> {
        self.books.read().get(symbol).cloned()
    }

    pub fn best_bid(&self, symbol: &str) -> Option<(Decimal, Decimal)> {
        self.books.read().get(symbol)?.best_bid()
    }

    pub fn best_ask(&self, symbol: &str) -> Option<(Decimal, Decimal)> {
        self.books.read().get(symbol)?.best_ask()
    }

    pub fn remove(&self, symbol: &str) -> Option<OrderBook> {
        self.books.write().remove(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }
}
