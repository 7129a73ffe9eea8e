//! In-Memory Symbol Catalog
//!
//! A `SymbolCatalog` built from unified `BASE/QUOTE` symbols. Native symbols
//! follow each exchange's naming:
//!
//! | Exchange | Spot       | Perpetual         |
//! |----------|------------|-------------------|
//! | Binance  | `BTCUSDT`  | `BTCUSDT`         |
//! | OKX      | `BTC-USDT` | `BTC-USDT-SWAP`   |
//! | Bybit    | `BTCUSDT`  | `BTCUSDT`         |
//!
//! OKX swaps trade in contracts; their contract values are registered with
//! each mapping so the tick normalizer can convert sizes to base units.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::application::ports::{ContractSpec, SymbolCatalog, SymbolMapping};
use crate::domain::market::{ExchangeId, MarketKind, Venue};

/// Known OKX USDT swap contract values (base units per contract).
const OKX_SWAP_CONTRACT_VALUES: &[(&str, i64, u32)] = &[("BTC", 1, 2), ("ETH", 1, 1)];

/// Exchange-native symbol for a base/quote pair.
#[must_use]
pub fn native_symbol(venue: Venue, base: &str, quote: &str) -> String {
    match (venue.exchange, venue.market) {
        (ExchangeId::Binance | ExchangeId::Bybit, _) => format!("{base}{quote}"),
        (ExchangeId::Okx, MarketKind::Spot) => format!("{base}-{quote}"),
        (ExchangeId::Okx, MarketKind::Perpetual) => format!("{base}-{quote}-SWAP"),
    }
}

/// Default contract terms for a venue and base asset.
fn default_contract(venue: Venue, base: &str) -> Option<ContractSpec> {
    if venue != Venue::new(ExchangeId::Okx, MarketKind::Perpetual) {
        return None;
    }
    let size = OKX_SWAP_CONTRACT_VALUES
        .iter()
        .find(|(asset, _, _)| *asset == base)
        .map_or(Decimal::ONE, |(_, mantissa, scale)| {
            Decimal::new(*mantissa, *scale)
        });
    Some(ContractSpec::linear(size))
}

#[derive(Debug, Default)]
struct Tables {
    by_raw: HashMap<(Venue, String), SymbolMapping>,
    by_unified: HashMap<(Venue, String), String>,
}

/// Symbol catalog held in memory.
#[derive(Debug, Default)]
pub struct StaticSymbolCatalog {
    tables: RwLock<Tables>,
}

impl StaticSymbolCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every symbol registered on every venue.
    #[must_use]
    pub fn with_symbols(venues: &[Venue], symbols: &[String]) -> Self {
        let catalog = Self::new();
        for venue in venues {
            for symbol in symbols {
                catalog.register(*venue, symbol);
            }
        }
        catalog
    }

    /// Register a unified `BASE/QUOTE` symbol with default contract terms.
    ///
    /// Returns the native symbol, or `None` when the symbol is malformed.
    pub fn register(&self, venue: Venue, unified_symbol: &str) -> Option<String> {
        let (base, _) = unified_symbol.split_once('/')?;
        let contract = default_contract(venue, base);
        self.register_with_contract(venue, unified_symbol, contract)
    }

    /// Register a unified `BASE/QUOTE` symbol with explicit contract terms.
    ///
    /// Returns the native symbol, or `None` when the symbol is malformed.
    pub fn register_with_contract(
        &self,
        venue: Venue,
        unified_symbol: &str,
        contract: Option<ContractSpec>,
    ) -> Option<String> {
        let (base, quote) = unified_symbol.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        let raw = native_symbol(venue, base, quote);
        let mapping = SymbolMapping {
            unified_symbol: unified_symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            market: venue.market,
            contract,
        };

        let mut tables = self.tables.write();
        tables.by_raw.insert((venue, raw.clone()), mapping);
        tables
            .by_unified
            .insert((venue, unified_symbol.to_string()), raw.clone());
        Some(raw)
    }

    /// Number of registered (venue, symbol) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().by_raw.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().by_raw.is_empty()
    }
}

impl SymbolCatalog for StaticSymbolCatalog {
    fn resolve(&self, venue: Venue, raw_symbol: &str) -> Option<SymbolMapping> {
        self.tables
            .read()
            .by_raw
            .get(&(venue, raw_symbol.to_string()))
            .cloned()
    }

    fn raw_symbol(&self, venue: Venue, unified_symbol: &str) -> Option<String> {
        self.tables
            .read()
            .by_unified
            .get(&(venue, unified_symbol.to_string()))
            .cloned()
    }
}
