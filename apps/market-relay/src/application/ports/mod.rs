//! Application Ports (Driver and Driven)
//!
//! Ports define interfaces for interacting with external systems.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketFeed`: a link (leaf, composite or sharded) producing raw records
//! - `SymbolCatalog`: raw <-> unified symbol resolution
//! - `PubSub`: topic publish/subscribe backend
//! - `KlineHistory`: historical klines for window catch-up

mod kline_history_port;
mod market_feed_port;
mod pub_sub_port;
mod symbol_catalog_port;

pub use kline_history_port::{HistoryError, KlineHistory};
pub use market_feed_port::MarketFeed;
pub use pub_sub_port::PubSub;
#[cfg(test)]
pub use symbol_catalog_port::MockSymbolCatalog;
pub use symbol_catalog_port::{ContractSpec, SymbolCatalog, SymbolMapping};
