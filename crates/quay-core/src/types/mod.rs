//! Core data types shared between the socket layer, the parsers supplied by
//! exchange adapters, and the order-book reconciler.

pub mod enums;
pub mod market_data;

pub use enums::*;
pub use market_data::*;
