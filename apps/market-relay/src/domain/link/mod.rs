//! Link Types
//!
//! Connection lifecycle states, feed channels and the desired-subscription
//! set a Link keeps independently of its connection.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Degraded -> (Connecting ...)
//!                                  \-> ShuttingDown -> Disconnected
//! ```
//!
//! Wire-level (un)subscribe operations are only sent while `Ready`. The
//! desired set survives reconnects and is replayed on every new connection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::domain::market::{ExchangeId, Interval, MarketKind};

// =============================================================================
// Link State
// =============================================================================

/// Connection lifecycle state of a Link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Connected; (un)subscribe operations are sent immediately.
    Ready,
    /// Connection lost; a reconnect is scheduled.
    Degraded,
    /// Shutdown requested.
    ShuttingDown,
}

impl LinkState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Numeric value for the link state gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Ready => 2.0,
            Self::Degraded => 3.0,
            Self::ShuttingDown => 4.0,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Feed Channels
// =============================================================================

/// Coarse channel kind, used to route operations inside composite links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Trade stream.
    Trades,
    /// Kline stream.
    Klines,
}

impl ChannelKind {
    /// Kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Klines => "klines",
        }
    }
}

/// A symbol-scoped upstream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedChannel {
    /// Trades.
    Trades,
    /// Klines at one interval.
    Klines(Interval),
}

impl FeedChannel {
    /// Coarse kind of this channel.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::Trades => ChannelKind::Trades,
            Self::Klines(_) => ChannelKind::Klines,
        }
    }
}

impl fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trades => f.write_str("trades"),
            Self::Klines(interval) => write!(f, "klines.{interval}"),
        }
    }
}

// =============================================================================
// Events and Status
// =============================================================================

/// Lifecycle events emitted by links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link changed state.
    StateChanged {
        /// Link id.
        link: String,
        /// New state.
        state: LinkState,
    },
    /// A link reconnected after having been ready before.
    Resumed {
        /// Link id.
        link: String,
    },
}

/// Point-in-time status of one leaf link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    /// Link id.
    pub id: String,
    /// Link category (e.g. `trades`, `klines`, `all`).
    pub category: String,
    /// Exchange.
    pub exchange: ExchangeId,
    /// Market kind.
    pub market: MarketKind,
    /// Current state.
    pub state: LinkState,
    /// Number of desired (channel, symbol) subscriptions.
    pub subscriptions: usize,
    /// Reconnects since start.
    pub reconnects: u64,
    /// Inbound frames since start.
    pub frames_received: u64,
    /// Time of the last inbound frame (ms).
    pub last_frame_ms: Option<i64>,
}

// =============================================================================
// Desired Subscriptions
// =============================================================================

/// Symbols a link should be subscribed to, per channel.
///
/// Mutations report only the symbols whose membership actually changed, so
/// the caller sends wire operations for real changes only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSubscriptions {
    channels: BTreeMap<FeedChannel, BTreeSet<String>>,
}

impl DesiredSubscriptions {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
        }
    }

    /// Add symbols, returning those that were not already present.
    pub fn insert(&mut self, channel: FeedChannel, symbols: &[String]) -> Vec<String> {
        let set = self.channels.entry(channel).or_default();
        symbols
            .iter()
            .filter(|symbol| set.insert((*symbol).clone()))
            .cloned()
            .collect()
    }

    /// Remove symbols, returning those that were present.
    pub fn remove(&mut self, channel: FeedChannel, symbols: &[String]) -> Vec<String> {
        let Some(set) = self.channels.get_mut(&channel) else {
            return Vec::new();
        };
        let removed = symbols
            .iter()
            .filter(|symbol| set.remove(symbol.as_str()))
            .cloned()
            .collect();
        if set.is_empty() {
            self.channels.remove(&channel);
        }
        removed
    }

    /// Whether a symbol is desired on a channel.
    #[must_use]
    pub fn contains(&self, channel: FeedChannel, symbol: &str) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|set| set.contains(symbol))
    }

    /// Total number of (channel, symbol) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.values().map(BTreeSet::len).sum()
    }

    /// Whether nothing is desired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Symbols desired on one channel.
    #[must_use]
    pub fn symbols(&self, channel: FeedChannel) -> Vec<String> {
        self.channels
            .get(&channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every channel with its symbols, in a stable order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(FeedChannel, Vec<String>)> {
        self.channels
            .iter()
            .map(|(channel, set)| (*channel, set.iter().cloned().collect()))
            .collect()
    }
}
