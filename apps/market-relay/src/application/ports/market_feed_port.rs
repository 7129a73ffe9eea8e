//! Market Feed Port (Driven Port)
//!
//! The single interface shared by leaf, composite and sharded links. Callers
//! drive symbol-scoped subscriptions and consume the merged raw streams
//! without knowing how many physical connections sit behind them.

use tokio::sync::broadcast;

use crate::domain::link::{FeedChannel, LinkEvent, LinkStatus};
use crate::domain::market::{RawKline, RawTick, Venue};

/// Port for an upstream market data link.
pub trait MarketFeed: Send + Sync {
    /// Link id.
    fn id(&self) -> &str;

    /// Link category (e.g. `trades`, `klines`, `all`).
    fn category(&self) -> &str;

    /// Venue served by this link.
    fn venue(&self) -> Venue;

    /// Add symbols to the desired set of a channel.
    fn subscribe(&self, channel: FeedChannel, symbols: &[String]);

    /// Remove symbols from the desired set of a channel.
    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]);

    /// Raw trade stream.
    fn trades(&self) -> broadcast::Receiver<RawTick>;

    /// Raw kline stream.
    fn klines(&self) -> broadcast::Receiver<RawKline>;

    /// Lifecycle events.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Start the connection task(s). Idempotent.
    fn start(&self);

    /// Stop the connection task(s). Idempotent.
    fn shutdown(&self);

    /// Whether every underlying connection is ready.
    fn is_ready(&self) -> bool;

    /// Status of every leaf link underneath.
    fn statuses(&self) -> Vec<LinkStatus>;
}
