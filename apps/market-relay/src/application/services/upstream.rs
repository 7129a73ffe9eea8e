//! Shared Upstream Interest
//!
//! Several fan-out services may sit on the same feed: the price and trade
//! fan-outs both consume a venue's trade channel. Each service counts its own
//! clients, so the upstream subscription itself needs a second count across
//! services. Only the first holder of a (venue, channel, symbol) subscribes
//! and only the last one to leave unsubscribes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::application::ports::MarketFeed;
use crate::domain::link::FeedChannel;
use crate::domain::market::Venue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InterestKey {
    venue: Venue,
    channel: FeedChannel,
    raw_symbol: String,
}

impl InterestKey {
    fn new(venue: Venue, channel: FeedChannel, raw_symbol: &str) -> Self {
        Self {
            venue,
            channel,
            raw_symbol: raw_symbol.to_string(),
        }
    }
}

/// Feeds by venue plus the holder count of every upstream subscription.
#[derive(Default)]
pub struct UpstreamInterest {
    feeds: RwLock<HashMap<Venue, Arc<dyn MarketFeed>>>,
    holders: Mutex<HashMap<InterestKey, usize>>,
}

impl UpstreamInterest {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the feed's venue with `feed`.
    ///
    /// Returns `true` when a different feed was serving the venue before.
    pub fn register(&self, feed: Arc<dyn MarketFeed>) -> bool {
        let venue = feed.venue();
        self.feeds
            .write()
            .insert(venue, Arc::clone(&feed))
            .is_some_and(|previous| !Arc::ptr_eq(&previous, &feed))
    }

    /// Feed serving `venue`.
    #[must_use]
    pub fn feed(&self, venue: Venue) -> Option<Arc<dyn MarketFeed>> {
        self.feeds.read().get(&venue).cloned()
    }

    /// Add one holder, subscribing upstream for the first.
    ///
    /// Returns `true` when the upstream subscribe was issued.
    pub fn retain(&self, venue: Venue, channel: FeedChannel, raw_symbol: &str) -> bool {
        let mut holders = self.holders.lock();
        let count = holders
            .entry(InterestKey::new(venue, channel, raw_symbol))
            .or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        match self.feed(venue) {
            Some(feed) => {
                feed.subscribe(channel, &[raw_symbol.to_string()]);
                true
            }
            None => false,
        }
    }

    /// Drop one holder, unsubscribing upstream once none is left.
    ///
    /// Returns `true` when the upstream unsubscribe was issued.
    pub fn release(&self, venue: Venue, channel: FeedChannel, raw_symbol: &str) -> bool {
        let mut holders = self.holders.lock();
        let key = InterestKey::new(venue, channel, raw_symbol);
        let Some(count) = holders.get_mut(&key) else {
            tracing::warn!(
                venue = %venue,
                channel = %channel,
                symbol = %raw_symbol,
                "Upstream release without a holder"
            );
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        holders.remove(&key);
        match self.feed(venue) {
            Some(feed) => {
                feed.unsubscribe(channel, &[raw_symbol.to_string()]);
                true
            }
            None => false,
        }
    }

    /// Holders of an upstream subscription.
    #[must_use]
    pub fn holders(&self, venue: Venue, channel: FeedChannel, raw_symbol: &str) -> usize {
        self.holders
            .lock()
            .get(&InterestKey::new(venue, channel, raw_symbol))
            .copied()
            .unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{ExchangeId, Interval, MarketKind};
    use crate::infrastructure::exchanges::BinanceAdapter;
    use crate::infrastructure::link::{Link, LinkConfig};

    fn venue() -> Venue {
        Venue::new(ExchangeId::Binance, MarketKind::Spot)
    }

    fn link() -> Link {
        Link::new(
            LinkConfig::new("binance.spot", "all"),
            Arc::new(BinanceAdapter::new(MarketKind::Spot)),
        )
    }

    #[test]
    fn last_holder_unsubscribes() {
        let link = link();
        let upstream = UpstreamInterest::new();
        upstream.register(Arc::new(link.clone()));

        assert!(upstream.retain(venue(), FeedChannel::Trades, "BTCUSDT"));
        assert!(!upstream.retain(venue(), FeedChannel::Trades, "BTCUSDT"));
        assert_eq!(upstream.holders(venue(), FeedChannel::Trades, "BTCUSDT"), 2);

        assert!(!upstream.release(venue(), FeedChannel::Trades, "BTCUSDT"));
        assert!(link.desired().contains(FeedChannel::Trades, "BTCUSDT"));

        assert!(upstream.release(venue(), FeedChannel::Trades, "BTCUSDT"));
        assert!(!link.desired().contains(FeedChannel::Trades, "BTCUSDT"));
        assert_eq!(upstream.holders(venue(), FeedChannel::Trades, "BTCUSDT"), 0);
    }

    #[test]
    fn channels_are_counted_separately() {
        let link = link();
        let upstream = UpstreamInterest::new();
        upstream.register(Arc::new(link.clone()));
        let m5 = FeedChannel::Klines(Interval::M5);

        upstream.retain(venue(), FeedChannel::Trades, "BTCUSDT");
        upstream.retain(venue(), m5, "BTCUSDT");
        upstream.release(venue(), FeedChannel::Trades, "BTCUSDT");

        assert!(!link.desired().contains(FeedChannel::Trades, "BTCUSDT"));
        assert!(link.desired().contains(m5, "BTCUSDT"));
    }

    #[test]
    fn unmatched_release_is_ignored() {
        let upstream = UpstreamInterest::new();
        upstream.register(Arc::new(link()));

        assert!(!upstream.release(venue(), FeedChannel::Trades, "BTCUSDT"));
        assert_eq!(upstream.holders(venue(), FeedChannel::Trades, "BTCUSDT"), 0);
    }

    #[test]
    fn registering_the_same_feed_twice_is_not_a_replacement() {
        let upstream = UpstreamInterest::new();
        let feed: Arc<dyn MarketFeed> = Arc::new(link());

        assert!(!upstream.register(Arc::clone(&feed)));
        assert!(!upstream.register(Arc::clone(&feed)));
        assert!(upstream.register(Arc::new(link())));
    }
}
