//! Symbol Catalog Port (Driven Port)
//!
//! Resolution between exchange-native symbols and unified `BASE/QUOTE`
//! symbols. The production catalog lives outside this service; the relay only
//! needs lookups in both directions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{MarketKind, Venue};

/// Contract terms for contract-denominated markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Contract size. Base units per contract for linear contracts, quote
    /// units per contract for inverse contracts.
    pub size: Decimal,
    /// Contract is inverse (quote-denominated).
    pub inverse: bool,
}

impl ContractSpec {
    /// Linear contract of the given size in base units.
    #[must_use]
    pub const fn linear(size: Decimal) -> Self {
        Self {
            size,
            inverse: false,
        }
    }

    /// Inverse contract of the given size in quote units.
    #[must_use]
    pub const fn inverse(size: Decimal) -> Self {
        Self {
            size,
            inverse: true,
        }
    }
}

/// A resolved symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMapping {
    /// Unified symbol (`BASE/QUOTE`).
    pub unified_symbol: String,
    /// Base asset.
    pub base: String,
    /// Quote asset.
    pub quote: String,
    /// Market kind.
    pub market: MarketKind,
    /// Contract terms when trade sizes are in contracts.
    pub contract: Option<ContractSpec>,
}

/// Port for symbol resolution.
#[cfg_attr(test, mockall::automock)]
pub trait SymbolCatalog: Send + Sync {
    /// Resolve an exchange-native symbol.
    fn resolve(&self, venue: Venue, raw_symbol: &str) -> Option<SymbolMapping>;

    /// Exchange-native symbol for a unified symbol.
    fn raw_symbol(&self, venue: Venue, unified_symbol: &str) -> Option<String>;
}
