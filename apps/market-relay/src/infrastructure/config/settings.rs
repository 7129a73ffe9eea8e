//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Malformed numeric values fall back to their defaults; an unknown exchange,
//! interval or symbol, or an empty list, is an error.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::market::{ExchangeId, Interval, MarketKind};

/// Link connection settings.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Keep-alive interval.
    pub heartbeat_interval: Duration,
    /// Silence before a connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum consecutive reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Symbols per (un)subscribe frame.
    pub subscribe_chunk_size: usize,
    /// Pause between consecutive (un)subscribe frames.
    pub subscribe_pacing: Duration,
    /// Trade silence that marks a connection as a zombie (`None` = off).
    pub stale_trade_threshold: Option<Duration>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
            subscribe_chunk_size: 500,
            subscribe_pacing: Duration::from_millis(1_000),
            stale_trade_threshold: Some(Duration::from_secs(180)),
        }
    }
}

/// Tick normalizer settings.
#[derive(Debug, Clone)]
pub struct TickerSettings {
    /// Window (ms) after an accepted tick in which spikes are rejected.
    pub spike_window_ms: i64,
    /// Relative move (percent) that counts as a spike.
    pub spike_threshold_pct: Decimal,
    /// Window (ms) in which an unchanged price is not re-emitted.
    pub price_dedup_ms: i64,
    /// Notional above which a trade is a block trade.
    pub block_notional: Decimal,
}

impl Default for TickerSettings {
    fn default() -> Self {
        Self {
            spike_window_ms: 5_000,
            spike_threshold_pct: Decimal::TWO,
            price_dedup_ms: 10_000,
            block_notional: Decimal::from(1_000_000),
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Capacity of raw/canonical trade channels.
    pub trade_capacity: usize,
    /// Capacity of raw/canonical kline channels.
    pub kline_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            trade_capacity: 10_000,
            kline_capacity: 1_000,
        }
    }
}

/// Fan-out service settings.
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Delay between the last release of a scope and its upstream teardown.
    pub teardown_delay: Duration,
    /// Capacity of each scope's broadcast channel.
    pub scope_capacity: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            teardown_delay: Duration::from_millis(5_000),
            scope_capacity: 1_024,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { metrics_port: 9090 }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Exchanges to connect to.
    pub exchanges: Vec<ExchangeId>,
    /// Market kind on every exchange.
    pub market: MarketKind,
    /// Unified symbols (`BASE/QUOTE`).
    pub symbols: Vec<String>,
    /// Kline intervals to subscribe.
    pub kline_intervals: Vec<Interval>,
    /// Children per sharded link (1 = no sharding).
    pub shards: usize,
    /// Link connection settings.
    pub link: LinkSettings,
    /// Tick normalizer settings.
    pub ticker: TickerSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Fan-out service settings.
    pub fanout: FanoutSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a list variable is empty or names something unknown.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a list variable is empty or names something unknown.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let exchanges = parse_list(&lookup, "RELAY_EXCHANGES", "binance")?
            .iter()
            .map(|name| {
                ExchangeId::from_str_case_insensitive(name)
                    .ok_or_else(|| ConfigError::UnknownExchange(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let market = lookup("RELAY_MARKET")
            .map(|s| MarketKind::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let symbols = parse_list(&lookup, "RELAY_SYMBOLS", "BTC/USDT")?
            .into_iter()
            .map(|symbol| {
                let upper = symbol.to_uppercase();
                match upper.split_once('/') {
                    Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(upper),
                    _ => Err(ConfigError::InvalidSymbol(symbol)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let kline_intervals = parse_list(&lookup, "RELAY_KLINE_INTERVALS", "1m")?
            .iter()
            .map(|s| Interval::parse(s).ok_or_else(|| ConfigError::UnknownInterval(s.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let link_defaults = LinkSettings::default();
        let stale_secs = parse_env_u64(&lookup, "RELAY_STALE_TRADE_SECS", 180);
        let link = LinkSettings {
            heartbeat_interval: parse_env_duration_secs(
                &lookup,
                "RELAY_HEARTBEAT_INTERVAL_SECS",
                link_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                &lookup,
                "RELAY_HEARTBEAT_TIMEOUT_SECS",
                link_defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                &lookup,
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                link_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &lookup,
                "RELAY_RECONNECT_DELAY_MAX_SECS",
                link_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                &lookup,
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                link_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                &lookup,
                "RELAY_MAX_RECONNECT_ATTEMPTS",
                link_defaults.max_reconnect_attempts,
            ),
            subscribe_chunk_size: parse_env_usize(
                &lookup,
                "RELAY_SUBSCRIBE_CHUNK_SIZE",
                link_defaults.subscribe_chunk_size,
            )
            .max(1),
            subscribe_pacing: parse_env_duration_millis(
                &lookup,
                "RELAY_SUBSCRIBE_PACING_MS",
                link_defaults.subscribe_pacing,
            ),
            stale_trade_threshold: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
        };

        let ticker_defaults = TickerSettings::default();
        let ticker = TickerSettings {
            spike_window_ms: parse_env_i64(
                &lookup,
                "RELAY_SPIKE_WINDOW_MS",
                ticker_defaults.spike_window_ms,
            ),
            spike_threshold_pct: parse_env_decimal(
                &lookup,
                "RELAY_SPIKE_THRESHOLD_PCT",
                ticker_defaults.spike_threshold_pct,
            ),
            price_dedup_ms: parse_env_i64(
                &lookup,
                "RELAY_PRICE_DEDUP_MS",
                ticker_defaults.price_dedup_ms,
            ),
            block_notional: parse_env_decimal(
                &lookup,
                "RELAY_BLOCK_NOTIONAL",
                ticker_defaults.block_notional,
            ),
        };

        let broadcast = BroadcastSettings {
            trade_capacity: parse_env_usize(
                &lookup,
                "RELAY_TRADE_CAPACITY",
                BroadcastSettings::default().trade_capacity,
            ),
            kline_capacity: parse_env_usize(
                &lookup,
                "RELAY_KLINE_CAPACITY",
                BroadcastSettings::default().kline_capacity,
            ),
        };

        let fanout = FanoutSettings {
            teardown_delay: parse_env_duration_millis(
                &lookup,
                "RELAY_TEARDOWN_DELAY_MS",
                FanoutSettings::default().teardown_delay,
            ),
            scope_capacity: parse_env_usize(
                &lookup,
                "RELAY_SCOPE_CAPACITY",
                FanoutSettings::default().scope_capacity,
            ),
        };

        let server = ServerSettings {
            metrics_port: parse_env_u16(
                &lookup,
                "RELAY_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        Ok(Self {
            exchanges,
            market,
            symbols,
            kline_intervals,
            shards: parse_env_usize(&lookup, "RELAY_SHARDS", 1).max(1),
            link,
            ticker,
            broadcast,
            fanout,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Exchange name is not supported.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    /// Kline interval is not supported.
    #[error("unknown kline interval: {0}")]
    UnknownInterval(String),
    /// Symbol is not of the form `BASE/QUOTE`.
    #[error("invalid symbol {0}, expected BASE/QUOTE")]
    InvalidSymbol(String),
}

fn parse_list<F>(lookup: &F, key: &str, default: &str) -> Result<Vec<String>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect();
    if items.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(items)
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_u16<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u16) -> u16 {
    parse_env(lookup, key, default)
}

fn parse_env_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    parse_env(lookup, key, default)
}

fn parse_env_u64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u64) -> u64 {
    parse_env(lookup, key, default)
}

fn parse_env_i64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: i64) -> i64 {
    parse_env(lookup, key, default)
}

fn parse_env_usize<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: usize) -> usize {
    parse_env(lookup, key, default)
}

fn parse_env_f64<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: f64) -> f64 {
    parse_env(lookup, key, default)
}

fn parse_env_decimal<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Decimal,
) -> Decimal {
    parse_env(lookup, key, default)
}

fn parse_env_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
