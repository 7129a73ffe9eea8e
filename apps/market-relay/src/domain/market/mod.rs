//! Market Data Types
//!
//! Exchange identities and the record shapes that flow through the relay:
//! exchange-native ticks/klines as decoded by the adapters, and the canonical
//! exchange-agnostic records produced by the normalizers.
//!
//! All timestamps are Unix epoch milliseconds.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::series::Timed;

// =============================================================================
// Exchange Identity
// =============================================================================

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    /// Binance.
    Binance,
    /// OKX.
    Okx,
    /// Bybit.
    Bybit,
}

impl ExchangeId {
    /// Parse an exchange name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "okx" => Some(Self::Okx),
            "bybit" => Some(Self::Bybit),
            _ => None,
        }
    }

    /// Get the exchange name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Bybit => "bybit",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market kind traded on an exchange.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    /// Spot market.
    #[default]
    Spot,
    /// Perpetual swap / futures market.
    Perpetual,
}

impl MarketKind {
    /// Parse a market kind, ignoring case. Unknown values map to spot.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "perpetual" | "perp" | "swap" | "futures" => Self::Perpetual,
            _ => Self::Spot,
        }
    }

    /// Get the market kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Perpetual => "perpetual",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange/market pair. One upstream connection group serves one venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Venue {
    /// Exchange.
    pub exchange: ExchangeId,
    /// Market kind.
    pub market: MarketKind,
}

impl Venue {
    /// Create a new venue.
    #[must_use]
    pub const fn new(exchange: ExchangeId, market: MarketKind) -> Self {
        Self { exchange, market }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.exchange, self.market)
    }
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Taker bought.
    Buy,
    /// Taker sold.
    Sell,
}

// =============================================================================
// Kline Interval
// =============================================================================

/// Kline (candle) interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// 1 minute.
    M1,
    /// 5 minutes.
    M5,
    /// 15 minutes.
    M15,
    /// 30 minutes.
    M30,
    /// 1 hour.
    H1,
    /// 4 hours.
    H4,
    /// 1 day.
    D1,
}

impl Interval {
    /// Parse the conventional short form (`1m`, `5m`, `1h`, `4h`, `1d`, ...).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Conventional short form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Interval length in milliseconds.
    #[must_use]
    pub const fn millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::M1 => MINUTE,
            Self::M5 => 5 * MINUTE,
            Self::M15 => 15 * MINUTE,
            Self::M30 => 30 * MINUTE,
            Self::H1 => 60 * MINUTE,
            Self::H4 => 240 * MINUTE,
            Self::D1 => 1_440 * MINUTE,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Exchange-Native Records
// =============================================================================

/// Exchange-native trade event, as decoded from the wire.
///
/// Sizes are in whatever unit the exchange reports: base units for most
/// markets, contracts for contract-denominated swaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    /// Exchange-native symbol (e.g. `BTCUSDT`, `BTC-USDT-SWAP`).
    pub raw_symbol: String,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Quote notional, when the exchange reports it.
    pub amount: Option<Decimal>,
    /// Taker side.
    pub side: Side,
    /// Exchange trade id.
    pub trade_id: String,
    /// Trade time (ms).
    pub ts: i64,
    /// Exchange flagged the trade as a block trade.
    pub block_hint: bool,
}

/// Exchange-native kline update, as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKline {
    /// Exchange-native symbol.
    pub raw_symbol: String,
    /// Kline interval.
    pub interval: Interval,
    /// Open time (ms).
    pub open_time: i64,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base volume.
    pub size: Decimal,
    /// Quote volume, when reported.
    pub amount: Option<Decimal>,
    /// Taker-buy base volume, when reported.
    pub buy_size: Option<Decimal>,
    /// Taker-buy quote volume, when reported.
    pub buy_amount: Option<Decimal>,
    /// Number of trades, when reported.
    pub trade_count: Option<u64>,
    /// Whether the kline is closed.
    pub closed: bool,
}

// =============================================================================
// Canonical Records
// =============================================================================

/// Exchange-agnostic trade. Immutable once built by the tick normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTrade {
    /// Exchange.
    pub exchange: ExchangeId,
    /// Market kind.
    pub market: MarketKind,
    /// Unified symbol (`BASE/QUOTE`).
    pub symbol: String,
    /// Base asset.
    pub base: String,
    /// Quote asset.
    pub quote: String,
    /// Trade time (ms).
    pub time: i64,
    /// Trade price.
    pub price: Decimal,
    /// Size in base units.
    pub size: Decimal,
    /// Notional in quote units.
    pub amount: Decimal,
    /// Exchange trade id.
    pub trade_id: String,
    /// Taker side.
    pub side: Side,
    /// Notional above the block threshold (or exchange-flagged block).
    pub is_block: bool,
}

/// Canonical last-price tick derived from an accepted trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPriceTick {
    /// Exchange.
    pub exchange: ExchangeId,
    /// Unified symbol.
    pub symbol: String,
    /// Base asset.
    pub base: String,
    /// Last price.
    pub price: Decimal,
    /// Trade time (ms).
    pub time: i64,
}

/// Exchange-agnostic kline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalKline {
    /// Exchange.
    pub exchange: ExchangeId,
    /// Market kind.
    pub market: MarketKind,
    /// Unified symbol.
    pub symbol: String,
    /// Kline interval.
    pub interval: Interval,
    /// Open time (ms).
    pub open_time: i64,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base volume.
    pub size: Decimal,
    /// Quote volume.
    pub amount: Decimal,
    /// Taker-buy base volume.
    pub buy_size: Decimal,
    /// Taker-buy quote volume.
    pub buy_amount: Decimal,
    /// Taker-sell base volume.
    pub sell_size: Decimal,
    /// Taker-sell quote volume.
    pub sell_amount: Decimal,
    /// Number of trades.
    pub trade_count: u64,
    /// Kline still open (not yet closed by the exchange).
    pub is_live: bool,
}

impl Timed for CanonicalTrade {
    fn ts(&self) -> i64 {
        self.time
    }
}

impl Timed for CanonicalPriceTick {
    fn ts(&self) -> i64 {
        self.time
    }
}

impl Timed for CanonicalKline {
    fn ts(&self) -> i64 {
        self.open_time
    }
}

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
