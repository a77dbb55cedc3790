//! # quay-md
//!
//! Market data assembly on top of the quay socket layer.
//!
//! ## Architecture
//!
//! A [`feed::MarketFeed`] owns one configured stream. Frames from its
//! endpoints are decoded by a [`parse::MessageParser`], book updates go
//! through the [`reconciler::OrderBookReconciler`] and land in a shared
//! [`book_store::BookStore`], and trades are de-duplicated by a
//! [`trades::TradeFilter`]. The feed reconnects on its own after a drop.
//!
//! ## Shared infrastructure
//!
//! - [`order_book`]: decimal-keyed price levels per market
//! - [`reconciler`]: snapshot/delta rules per delivery mode
//! - [`parse`]: parser seam and the canonical JSON format
//! - [`book_store`]: latest book per symbol, readable from any task

pub mod book_store;
pub mod feed;
pub mod order_book;
pub mod parse;
pub mod reconciler;
pub mod trades;

pub use book_store::BookStore;
pub use feed::{FeedEvent, MarketFeed};
pub use order_book::{LevelChange, OrderBook};
pub use parse::{CanonicalJsonParser, MessageParser};
pub use reconciler::{ApplyOutcome, OrderBookReconciler};
pub use trades::TradeFilter;
