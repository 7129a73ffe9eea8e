#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Relay - Crypto Market Data Multiplexer
//!
//! Maintains WebSocket connections to crypto exchanges (Binance, OKX, Bybit),
//! normalizes their trades and klines into exchange-agnostic records, filters
//! price spikes and fans the canonical streams out to any number of
//! in-process consumers with reference-counted subscriptions.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market types and pure logic
//!   - `market`: Exchanges, venues, raw and canonical records
//!   - `series`: Windowed series store
//!   - `link`: Link states, feed channels, desired subscriptions
//!   - `subscription`: Scope reference counting
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Market feeds, symbol catalog, pub/sub, kline history
//!   - `services`: Tick normalizer, kline normalizer, subscription fan-out
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `link`: Exchange, composite and sharded links
//!   - `exchanges`: Per-exchange wire protocol adapters
//!   - `channel`: Broadcast channels and the in-process bus
//!   - `catalog`: In-memory symbol catalog
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Binance WS ──┐
//!              │   ┌──────────┐   ┌─────────────┐   ┌─────────┐   ┌───────────┐
//! OKX WS ──────┼──►│  Links   │──►│ Normalizers │──►│ Pub/Sub │──►│  Fan-out  │──► Consumer 1
//!              │   │ (sharded)│   │ (tick/kline)│   │ topics  │   │  scopes   │──► Consumer N
//! Bybit WS ────┘   └──────────┘   └─────────────┘   └─────────┘   └───────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::link::{ChannelKind, FeedChannel, LinkEvent, LinkState, LinkStatus};
pub use domain::market::{
    CanonicalKline, CanonicalPriceTick, CanonicalTrade, ExchangeId, Interval, MarketKind, RawKline,
    RawTick, Side, Venue,
};
pub use domain::series::{MergeOptions, SeriesStore, Timed};
pub use domain::subscription::{ClientId, ScopeKey};

// Ports
pub use application::ports::{
    ContractSpec, HistoryError, KlineHistory, MarketFeed, PubSub, SymbolCatalog, SymbolMapping,
};

// Services
pub use application::services::{
    FanoutError, FanoutService, KlineNormalizer, KlineWindow, PriceBounds, ScopeSubscription,
    TickerConfig, TickerHandler, TickerSink, UpstreamInterest, WatchOutcome,
};

// Links (for integration tests)
pub use infrastructure::link::{
    CompositeLink, InstanceCriteria, Link, LinkConfig, LinkError, LinkNode, ShardError,
    ShardedLink, find_instances,
};

// Channels and catalog
pub use infrastructure::catalog::StaticSymbolCatalog;
pub use infrastructure::channel::{Channel, InProcessBus, topics};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, FanoutSettings, LinkSettings, RelayConfig, ServerSettings,
    TickerSettings,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
