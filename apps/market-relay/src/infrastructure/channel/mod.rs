//! Broadcast Channel Adapters
//!
//! Message distribution on tokio broadcast channels.
//!
//! # Shapes
//!
//! - `Channel<T>`: a global broadcast point. Subscribing hands out a
//!   receiver; dropping the receiver unsubscribes.
//! - Symbol-scoped channels are the links themselves (`MarketFeed`):
//!   `subscribe(channel, symbols)` / `unsubscribe(channel, symbols)` drive the
//!   upstream and `trades()` / `klines()` are the streams.
//! - `InProcessBus<T>`: a topic registry implementing the `PubSub` port, used
//!   when no durable broker is configured.
//!
//! Publishing never blocks: every receiver buffers up to the channel capacity
//! and a slow receiver observes `Lagged` instead of stalling ingestion.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::PubSub;
use crate::domain::market::Venue;

// =============================================================================
// Channel
// =============================================================================

/// Global multi-subscriber broadcast point.
#[derive(Debug)]
pub struct Channel<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Channel<T> {
    /// Create a channel buffering up to `capacity` records per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Publish a record to all current receivers.
    ///
    /// Returns the number of receivers reached (0 when nobody listens).
    pub fn publish(&self, record: T) -> usize {
        self.tx.send(record).unwrap_or(0)
    }

    /// Get a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// =============================================================================
// Forwarding
// =============================================================================

/// Forward every record from `rx` into `to` until cancelled or `rx` closes.
///
/// Used to merge child link streams into a parent's channel.
pub fn forward<T>(
    mut rx: broadcast::Receiver<T>,
    to: Channel<T>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(record) => {
                        to.publish(record);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Forwarder lagged, records dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

// =============================================================================
// In-Process Bus
// =============================================================================

/// Topic names used between the normalizers and their consumers.
pub mod topics {
    use super::Venue;

    /// Canonical price ticks of a venue.
    #[must_use]
    pub fn prices(venue: Venue) -> String {
        format!("prices.{}.{}", venue.exchange, venue.market)
    }

    /// Canonical trades of a venue.
    #[must_use]
    pub fn trades(venue: Venue) -> String {
        format!("trades.{}.{}", venue.exchange, venue.market)
    }

    /// Canonical klines of a venue.
    #[must_use]
    pub fn klines(venue: Venue) -> String {
        format!("klines.{}.{}", venue.exchange, venue.market)
    }
}

/// In-process topic registry.
///
/// Topics are created lazily on first subscribe. Publishing to a topic
/// nobody listens to is a no-op, and a topic whose receivers are all gone is
/// dropped on the next publish.
#[derive(Debug)]
pub struct InProcessBus<T> {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> InProcessBus<T> {
    /// Create a bus whose topics buffer up to `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of registered topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

impl<T: Clone + Send> PubSub<T> for InProcessBus<T> {
    fn publish(&self, topic: &str, record: T) -> usize {
        let mut topics = self.topics.lock();
        let Some(tx) = topics.get(topic) else {
            return 0;
        };
        if let Ok(reached) = tx.send(record) {
            reached
        } else {
            topics.remove(topic);
            0
        }
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::market::{ExchangeId, MarketKind};

    #[test]
    fn channel_publish_without_receivers_is_noop() {
        let channel: Channel<u32> = Channel::new(4);
        assert_eq!(channel.publish(1), 0);
    }

    #[tokio::test]
    async fn channel_fans_out_in_order() {
        let channel = Channel::new(8);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        assert_eq!(channel.publish(1), 2);
        assert_eq!(channel.publish(2), 2);

        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(a.recv().await.unwrap(), 2);
        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 2);
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let channel: Channel<u32> = Channel::new(4);
        let rx = channel.subscribe();
        assert_eq!(channel.receiver_count(), 1);
        drop(rx);
        assert_eq!(channel.receiver_count(), 0);
    }

    #[tokio::test]
    async fn forward_merges_into_target() {
        let source = Channel::new(8);
        let target = Channel::new(8);
        let mut out = target.subscribe();
        let cancel = CancellationToken::new();

        let handle = forward(source.subscribe(), target.clone(), cancel.clone());
        source.publish("a");

        let got = tokio::time::timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "a");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bus_routes_by_topic() {
        let bus = InProcessBus::new(8);
        let mut btc = bus.subscribe("prices.binance.spot");
        let mut eth = bus.subscribe("prices.okx.spot");

        assert_eq!(bus.publish("prices.binance.spot", 1), 1);
        assert_eq!(bus.publish("prices.okx.spot", 2), 1);
        assert_eq!(bus.publish("prices.bybit.spot", 3), 0);

        assert_eq!(btc.recv().await.unwrap(), 1);
        assert_eq!(eth.recv().await.unwrap(), 2);
    }

    #[test]
    fn bus_drops_abandoned_topics() {
        let bus = InProcessBus::new(8);
        let rx = bus.subscribe("t");
        assert_eq!(bus.topic_count(), 1);
        drop(rx);
        assert_eq!(bus.publish("t", 1), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn topic_names() {
        let venue = Venue::new(ExchangeId::Bybit, MarketKind::Perpetual);
        assert_eq!(topics::prices(venue), "prices.bybit.perpetual");
        assert_eq!(topics::trades(venue), "trades.bybit.perpetual");
        assert_eq!(topics::klines(venue), "klines.bybit.perpetual");
    }
}
