//! Subscription Fan-out Service
//!
//! Turns one upstream feed per venue into any number of independently
//! released consumer subscriptions. Interest is reference-counted per scope
//! (venue, symbol[, interval]):
//!
//! - the first acquisition subscribes upstream and creates the scope channel
//! - later acquisitions join the existing channel
//! - the last release starts a teardown timer instead of unsubscribing, and an
//!   acquisition before it fires cancels the teardown
//!
//! When a feed reports `Resumed`, every scope that still has clients is
//! subscribed again.
//!
//! Services that share a feed share its [`UpstreamInterest`], so one
//! service's teardown never unsubscribes a symbol another still serves.
//!
//! # Locking
//!
//! Registry changes and the upstream calls they imply happen under one
//! mutex, so a teardown's unsubscribe can never overtake a fresh subscribe.
//! The upstream holder lock is always taken after it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MarketFeed, SymbolCatalog};
use crate::domain::link::{FeedChannel, LinkEvent};
use crate::domain::market::{CanonicalKline, CanonicalPriceTick, CanonicalTrade, Interval, Venue};
use crate::domain::subscription::{Acquisition, ClientId, ScopeKey, ScopeRegistry};
use crate::infrastructure::config::FanoutSettings;
use crate::infrastructure::metrics;

use super::upstream::UpstreamInterest;

// =============================================================================
// Records
// =============================================================================

/// A canonical record that belongs to one fan-out scope.
pub trait ScopedRecord: Clone + Send + Sync + 'static {
    /// Stream label for logs and metrics.
    const STREAM: &'static str;

    /// Unified symbol.
    fn symbol(&self) -> &str;

    /// Kline interval, for interval-scoped records.
    fn interval(&self) -> Option<Interval> {
        None
    }
}

/// A scoped record carrying a price.
pub trait PricedRecord: ScopedRecord {
    /// Record price.
    fn price(&self) -> Decimal;
}

impl ScopedRecord for CanonicalPriceTick {
    const STREAM: &'static str = "prices";

    fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl PricedRecord for CanonicalPriceTick {
    fn price(&self) -> Decimal {
        self.price
    }
}

impl ScopedRecord for CanonicalTrade {
    const STREAM: &'static str = "trades";

    fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl PricedRecord for CanonicalTrade {
    fn price(&self) -> Decimal {
        self.price
    }
}

impl ScopedRecord for CanonicalKline {
    const STREAM: &'static str = "klines";

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn interval(&self) -> Option<Interval> {
        Some(self.interval)
    }
}

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Fan-out acquisition errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    /// No feed is attached for the venue.
    #[error("no feed attached for {0}")]
    UnknownVenue(Venue),

    /// The catalog has no native symbol for the unified symbol.
    #[error("{symbol} is not listed on {venue}")]
    UnknownSymbol {
        /// Venue asked for.
        venue: Venue,
        /// Unified symbol asked for.
        symbol: String,
    },
}

/// Bounds and deadline for [`FanoutService::watch_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceBounds {
    /// Completes once the price is at or below this.
    pub lower: Decimal,
    /// Completes once the price is at or above this.
    pub upper: Decimal,
    /// Gives up after this long.
    pub timeout: Duration,
}

impl PriceBounds {
    /// Create bounds.
    #[must_use]
    pub const fn new(lower: Decimal, upper: Decimal, timeout: Duration) -> Self {
        Self {
            lower,
            upper,
            timeout,
        }
    }
}

/// How a bounded watch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The price reached the lower bound.
    ReachLower {
        /// Price that crossed.
        price: Decimal,
    },
    /// The price reached the upper bound.
    ReachUpper {
        /// Price that crossed.
        price: Decimal,
    },
    /// Neither bound was reached in time.
    Timeout {
        /// Last price seen, if any.
        price: Option<Decimal>,
    },
}

impl WatchOutcome {
    /// Last observed price.
    #[must_use]
    pub const fn price(&self) -> Option<Decimal> {
        match self {
            Self::ReachLower { price } | Self::ReachUpper { price } => Some(*price),
            Self::Timeout { price } => *price,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Scope<R> {
    tx: broadcast::Sender<R>,
    raw_symbol: String,
}

struct FanoutState<R> {
    registry: ScopeRegistry<Scope<R>>,
    teardowns: HashMap<ScopeKey, CancellationToken>,
}

struct FanoutInner<R: ScopedRecord> {
    catalog: Arc<dyn SymbolCatalog>,
    settings: FanoutSettings,
    upstream: Arc<UpstreamInterest>,
    state: Mutex<FanoutState<R>>,
    next_client: AtomicU64,
    cancel: CancellationToken,
}

impl<R: ScopedRecord> FanoutInner<R> {
    fn feed(&self, venue: Venue) -> Result<Arc<dyn MarketFeed>, FanoutError> {
        self.upstream
            .feed(venue)
            .ok_or(FanoutError::UnknownVenue(venue))
    }

    fn dispatch(&self, venue: Venue, record: R) {
        let key = ScopeKey::new(venue, record.symbol(), record.interval());
        let state = self.state.lock();
        if let Some(scope) = state.registry.get(&key) {
            let _ = scope.tx.send(record);
        }
    }

    /// Remove a client; the last one out schedules the teardown.
    fn release(this: &Arc<Self>, key: &ScopeKey, client: ClientId) {
        let mut state = this.state.lock();
        let Some(ticket) = state.registry.release(key, client) else {
            return;
        };
        let timer = CancellationToken::new();
        if let Some(previous) = state.teardowns.insert(key.clone(), timer.clone()) {
            previous.cancel();
        }
        drop(state);

        tracing::debug!(
            scope = %key,
            delay_ms = this.settings.teardown_delay.as_millis(),
            "Scope released, teardown scheduled"
        );

        let Ok(runtime) = Handle::try_current() else {
            this.complete_teardown(key, ticket);
            return;
        };
        let inner = Arc::clone(this);
        let key = key.clone();
        let delay = this.settings.teardown_delay;
        runtime.spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = inner.cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => inner.complete_teardown(&key, ticket),
            }
        });
    }

    fn complete_teardown(&self, key: &ScopeKey, ticket: u64) {
        let mut state = self.state.lock();
        let Some(scope) = state.registry.complete_teardown(key, ticket) else {
            return;
        };
        state.teardowns.remove(key);
        self.upstream.release(key.venue, key.channel(), &scope.raw_symbol);
        let scopes = state.registry.len();
        drop(state);

        metrics::set_fanout_scopes(R::STREAM, scopes);
        tracing::debug!(scope = %key, "Scope torn down");
    }

    /// Subscribe every live scope of `venue` again.
    fn replay(&self, venue: Venue, link: &str) {
        let Ok(feed) = self.feed(venue) else {
            return;
        };
        let state = self.state.lock();
        let mut channels: BTreeMap<FeedChannel, Vec<String>> = BTreeMap::new();
        for key in state.registry.live_scopes() {
            if key.venue != venue {
                continue;
            }
            if let Some(scope) = state.registry.get(&key) {
                channels
                    .entry(key.channel())
                    .or_default()
                    .push(scope.raw_symbol.clone());
            }
        }

        let mut replayed = 0;
        for (channel, symbols) in &channels {
            replayed += symbols.len();
            feed.subscribe(*channel, symbols);
        }
        drop(state);

        tracing::info!(
            stream = R::STREAM,
            venue = %venue,
            link = %link,
            scopes = replayed,
            "Live scopes replayed after reconnect"
        );
    }

    async fn route(
        &self,
        venue: Venue,
        mut source: broadcast::Receiver<R>,
        mut events: broadcast::Receiver<LinkEvent>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                received = source.recv() => match received {
                    Ok(record) => self.dispatch(venue, record),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            stream = R::STREAM,
                            venue = %venue,
                            skipped,
                            "Fan-out router lagged, records dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                },
                event = events.recv(), if events_open => match event {
                    Ok(LinkEvent::Resumed { link }) => self.replay(venue, &link),
                    Ok(LinkEvent::StateChanged { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(venue = %venue, skipped, "Link events lagged");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
            }
        }
        tracing::debug!(stream = R::STREAM, venue = %venue, "Fan-out router stopped");
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// One consumer's view of a scope. Dropping it releases the scope.
pub struct ScopeSubscription<R: ScopedRecord> {
    key: ScopeKey,
    client: ClientId,
    rx: broadcast::Receiver<R>,
    inner: Arc<FanoutInner<R>>,
    released: bool,
}

impl<R: ScopedRecord> ScopeSubscription<R> {
    /// Scope this subscription belongs to.
    #[must_use]
    pub const fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Client id assigned at acquisition.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client
    }

    /// Next record of the scope.
    ///
    /// # Errors
    ///
    /// `Lagged` when this consumer fell behind, `Closed` once the service shut
    /// down.
    pub async fn recv(&mut self) -> Result<R, RecvError> {
        self.rx.recv().await
    }

    /// Release the scope now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            FanoutInner::release(&self.inner, &self.key, self.client);
        }
    }
}

impl<R: ScopedRecord> Drop for ScopeSubscription<R> {
    fn drop(&mut self) {
        self.release_once();
    }
}

// =============================================================================
// Fan-out Service
// =============================================================================

/// Reference-counted fan-out of one record stream per venue.
pub struct FanoutService<R: ScopedRecord> {
    inner: Arc<FanoutInner<R>>,
}

impl<R: ScopedRecord> Clone for FanoutService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ScopedRecord> FanoutService<R> {
    /// Create a service with no feeds attached and upstream interest of its
    /// own.
    #[must_use]
    pub fn new(catalog: Arc<dyn SymbolCatalog>, settings: FanoutSettings) -> Self {
        Self::with_upstream(catalog, Arc::new(UpstreamInterest::new()), settings)
    }

    /// Create a service that counts upstream interest together with every
    /// other service built on the same `upstream`.
    #[must_use]
    pub fn with_upstream(
        catalog: Arc<dyn SymbolCatalog>,
        upstream: Arc<UpstreamInterest>,
        settings: FanoutSettings,
    ) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                catalog,
                settings,
                upstream,
                state: Mutex::new(FanoutState {
                    registry: ScopeRegistry::new(),
                    teardowns: HashMap::new(),
                }),
                next_client: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Serve the venue of `feed` from `source`, the venue's canonical stream.
    ///
    /// Must be called inside a Tokio runtime. Returns the router task.
    pub fn attach(&self, feed: Arc<dyn MarketFeed>, source: broadcast::Receiver<R>) -> JoinHandle<()> {
        let venue = feed.venue();
        let events = feed.events();
        if self.inner.upstream.register(feed) {
            tracing::warn!(stream = R::STREAM, venue = %venue, "Feed replaced");
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.route(venue, source, events).await })
    }

    /// Acquire a scope, subscribing upstream on first interest.
    ///
    /// # Errors
    ///
    /// Returns `UnknownVenue` when no feed serves `venue` and `UnknownSymbol`
    /// when the catalog cannot map `symbol`.
    pub fn acquire(
        &self,
        venue: Venue,
        symbol: &str,
        interval: Option<Interval>,
    ) -> Result<ScopeSubscription<R>, FanoutError> {
        self.inner.feed(venue)?;
        let raw_symbol = self.inner.catalog.raw_symbol(venue, symbol).ok_or_else(|| {
            FanoutError::UnknownSymbol {
                venue,
                symbol: symbol.to_string(),
            }
        })?;

        let key = ScopeKey::new(venue, symbol, interval);
        let client = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        let capacity = self.inner.settings.scope_capacity.max(1);

        let mut state = self.inner.state.lock();
        let (acquisition, scope) = state.registry.acquire(&key, client, || Scope {
            tx: broadcast::channel(capacity).0,
            raw_symbol: raw_symbol.clone(),
        });
        let rx = scope.tx.subscribe();

        match acquisition {
            Acquisition::Created => {
                self.inner.upstream.retain(venue, key.channel(), &raw_symbol);
                tracing::debug!(scope = %key, client, "Scope created");
            }
            Acquisition::Joined { cancelled_teardown } => {
                if cancelled_teardown.is_some()
                    && let Some(timer) = state.teardowns.remove(&key)
                {
                    timer.cancel();
                    tracing::debug!(scope = %key, client, "Pending teardown cancelled");
                }
            }
        }
        let scopes = state.registry.len();
        drop(state);
        metrics::set_fanout_scopes(R::STREAM, scopes);

        Ok(ScopeSubscription {
            key,
            client,
            rx,
            inner: Arc::clone(&self.inner),
            released: false,
        })
    }

    /// Upstream interest this service counts into.
    #[must_use]
    pub fn upstream(&self) -> &Arc<UpstreamInterest> {
        &self.inner.upstream
    }

    /// Number of clients holding a scope.
    #[must_use]
    pub fn client_count(&self, key: &ScopeKey) -> usize {
        self.inner.state.lock().registry.client_count(key)
    }

    /// Whether a scope is waiting out its teardown delay.
    #[must_use]
    pub fn is_pending_teardown(&self, key: &ScopeKey) -> bool {
        self.inner.state.lock().registry.is_pending_teardown(key)
    }

    /// Registered scopes, including those pending teardown.
    #[must_use]
    pub fn scope_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Stop routing and drop every scope, releasing its upstream interest.
    /// Open subscriptions see `Closed`.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock();
        for (_, timer) in state.teardowns.drain() {
            timer.cancel();
        }
        let scopes = state.registry.drain();
        for (key, scope) in &scopes {
            self.inner.upstream.release(key.venue, key.channel(), &scope.raw_symbol);
        }
        let dropped = scopes.len();
        drop(state);

        metrics::set_fanout_scopes(R::STREAM, 0);
        tracing::info!(stream = R::STREAM, scopes = dropped, "Fan-out service stopped");
    }
}

impl<R: PricedRecord> FanoutService<R> {
    /// Watch a symbol's price until it leaves `bounds` or the deadline passes.
    ///
    /// The scope acquired for the watch is released on every outcome.
    ///
    /// # Errors
    ///
    /// Same as [`FanoutService::acquire`].
    pub async fn watch_bounded(
        &self,
        venue: Venue,
        symbol: &str,
        bounds: PriceBounds,
    ) -> Result<WatchOutcome, FanoutError> {
        let mut subscription = self.acquire(venue, symbol, None)?;
        let deadline = tokio::time::sleep(bounds.timeout);
        tokio::pin!(deadline);

        let mut last_price = None;
        let outcome = loop {
            tokio::select! {
                () = &mut deadline => break WatchOutcome::Timeout { price: last_price },
                received = subscription.recv() => match received {
                    Ok(record) => {
                        let price = record.price();
                        last_price = Some(price);
                        if price <= bounds.lower {
                            break WatchOutcome::ReachLower { price };
                        }
                        if price >= bounds.upper {
                            break WatchOutcome::ReachUpper { price };
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(symbol = %symbol, skipped, "Bounded watch lagged");
                    }
                    Err(RecvError::Closed) => {
                        (&mut deadline).await;
                        break WatchOutcome::Timeout { price: last_price };
                    }
                },
            }
        };
        subscription.release();

        tracing::debug!(venue = %venue, symbol = %symbol, outcome = ?outcome, "Bounded watch finished");
        Ok(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::link::LinkStatus;
    use crate::domain::market::{ExchangeId, MarketKind, RawKline, RawTick};
    use crate::infrastructure::catalog::StaticSymbolCatalog;
    use crate::infrastructure::channel::Channel;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Subscribe(FeedChannel, Vec<String>),
        Unsubscribe(FeedChannel, Vec<String>),
    }

    struct FakeFeed {
        venue: Venue,
        ops: Mutex<Vec<Op>>,
        trades: Channel<RawTick>,
        klines: Channel<RawKline>,
        events: Channel<LinkEvent>,
    }

    impl FakeFeed {
        fn new(venue: Venue) -> Self {
            Self {
                venue,
                ops: Mutex::new(Vec::new()),
                trades: Channel::new(8),
                klines: Channel::new(8),
                events: Channel::new(8),
            }
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().clone()
        }
    }

    impl MarketFeed for FakeFeed {
        fn id(&self) -> &str {
            "fake"
        }

        fn category(&self) -> &str {
            "all"
        }

        fn venue(&self) -> Venue {
            self.venue
        }

        fn subscribe(&self, channel: FeedChannel, symbols: &[String]) {
            self.ops.lock().push(Op::Subscribe(channel, symbols.to_vec()));
        }

        fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
            self.ops.lock().push(Op::Unsubscribe(channel, symbols.to_vec()));
        }

        fn trades(&self) -> broadcast::Receiver<RawTick> {
            self.trades.subscribe()
        }

        fn klines(&self) -> broadcast::Receiver<RawKline> {
            self.klines.subscribe()
        }

        fn events(&self) -> broadcast::Receiver<LinkEvent> {
            self.events.subscribe()
        }

        fn start(&self) {}

        fn shutdown(&self) {}

        fn is_ready(&self) -> bool {
            true
        }

        fn statuses(&self) -> Vec<LinkStatus> {
            Vec::new()
        }
    }

    fn venue() -> Venue {
        Venue::new(ExchangeId::Binance, MarketKind::Spot)
    }

    fn tick(symbol: &str, price: Decimal) -> CanonicalPriceTick {
        CanonicalPriceTick {
            exchange: ExchangeId::Binance,
            symbol: symbol.to_string(),
            base: "BTC".to_string(),
            price,
            time: 0,
        }
    }

    fn service() -> (
        FanoutService<CanonicalPriceTick>,
        Arc<FakeFeed>,
        broadcast::Sender<CanonicalPriceTick>,
    ) {
        let catalog = StaticSymbolCatalog::with_symbols(
            &[venue()],
            &["BTC/USDT".to_string(), "ETH/USDT".to_string()],
        );
        let service = FanoutService::new(Arc::new(catalog), FanoutSettings::default());
        let feed = Arc::new(FakeFeed::new(venue()));
        let (tx, rx) = broadcast::channel(64);
        service.attach(feed.clone(), rx);
        (service, feed, tx)
    }

    fn btc() -> ScopeKey {
        ScopeKey::new(venue(), "BTC/USDT", None)
    }

    fn sub(symbol: &str) -> Op {
        Op::Subscribe(FeedChannel::Trades, vec![symbol.to_string()])
    }

    fn unsub(symbol: &str) -> Op {
        Op::Unsubscribe(FeedChannel::Trades, vec![symbol.to_string()])
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_subscribes_upstream_once() {
        let (service, feed, _tx) = service();
        let first = service.acquire(venue(), "BTC/USDT", None).unwrap();
        let second = service.acquire(venue(), "BTC/USDT", None).unwrap();

        assert_eq!(feed.ops(), vec![sub("BTCUSDT")]);
        assert_eq!(service.client_count(&btc()), 2);
        assert_ne!(first.client_id(), second.client_id());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_client_keeps_receiving() {
        let (service, _feed, tx) = service();
        let first = service.acquire(venue(), "BTC/USDT", None).unwrap();
        let mut second = service.acquire(venue(), "BTC/USDT", None).unwrap();
        first.release();

        tx.send(tick("BTC/USDT", dec!(100))).unwrap();
        assert_eq!(second.recv().await.unwrap().price, dec!(100));
        assert!(!service.is_pending_teardown(&btc()));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_fires_after_delay() {
        let (service, feed, _tx) = service();
        let subscription = service.acquire(venue(), "BTC/USDT", None).unwrap();
        drop(subscription);

        assert!(service.is_pending_teardown(&btc()));
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(feed.ops(), vec![sub("BTCUSDT")]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(feed.ops(), vec![sub("BTCUSDT"), unsub("BTCUSDT")]);
        assert_eq!(service.scope_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_cancels_pending_teardown() {
        let (service, feed, _tx) = service();
        let first = service.acquire(venue(), "BTC/USDT", None).unwrap();
        let second = service.acquire(venue(), "BTC/USDT", None).unwrap();
        first.release();
        second.release();
        assert!(service.is_pending_teardown(&btc()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let _third = service.acquire(venue(), "BTC/USDT", None).unwrap();
        assert!(!service.is_pending_teardown(&btc()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(feed.ops(), vec![sub("BTCUSDT")]);
        assert_eq!(service.client_count(&btc()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_reach_only_their_scope() {
        let (service, _feed, tx) = service();
        let mut btc_sub = service.acquire(venue(), "BTC/USDT", None).unwrap();
        let mut eth_sub = service.acquire(venue(), "ETH/USDT", None).unwrap();

        tx.send(tick("ETH/USDT", dec!(2))).unwrap();
        tx.send(tick("BTC/USDT", dec!(1))).unwrap();

        assert_eq!(btc_sub.recv().await.unwrap().price, dec!(1));
        assert_eq!(eth_sub.recv().await.unwrap().price, dec!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_venue_and_symbol_are_rejected() {
        let (service, feed, _tx) = service();
        let okx = Venue::new(ExchangeId::Okx, MarketKind::Spot);

        assert_eq!(
            service.acquire(okx, "BTC/USDT", None).err(),
            Some(FanoutError::UnknownVenue(okx))
        );
        assert!(matches!(
            service.acquire(venue(), "DOGE/USDT", None),
            Err(FanoutError::UnknownSymbol { .. })
        ));
        assert!(feed.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_feed_replays_live_scopes() {
        let (service, feed, _tx) = service();
        let _btc = service.acquire(venue(), "BTC/USDT", None).unwrap();
        let eth = service.acquire(venue(), "ETH/USDT", None).unwrap();
        eth.release();

        feed.events.publish(LinkEvent::Resumed {
            link: "fake".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(
            feed.ops(),
            vec![sub("BTCUSDT"), sub("ETHUSDT"), sub("BTCUSDT")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watch_times_out_and_releases() {
        let (service, _feed, tx) = service();
        let holder = service.acquire(venue(), "BTC/USDT", None).unwrap();

        let watcher = service.clone();
        let watch = tokio::spawn(async move {
            watcher
                .watch_bounded(
                    venue(),
                    "BTC/USDT",
                    PriceBounds::new(dec!(90), dec!(110), Duration::from_secs(1)),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.client_count(&btc()), 2);
        tx.send(tick("BTC/USDT", dec!(100))).unwrap();

        let outcome = watch.await.unwrap().unwrap();
        assert_eq!(outcome, WatchOutcome::Timeout { price: Some(dec!(100)) });
        assert_eq!(service.client_count(&btc()), 1);
        drop(holder);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_completes_on_either_bound() {
        let (service, _feed, tx) = service();
        let bounds = PriceBounds::new(dec!(90), dec!(110), Duration::from_secs(60));

        for (price, expected) in [
            (dec!(89), WatchOutcome::ReachLower { price: dec!(89) }),
            (dec!(110), WatchOutcome::ReachUpper { price: dec!(110) }),
        ] {
            let watcher = service.clone();
            let watch =
                tokio::spawn(async move { watcher.watch_bounded(venue(), "BTC/USDT", bounds).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(tick("BTC/USDT", dec!(100))).unwrap();
            tx.send(tick("BTC/USDT", price)).unwrap();

            assert_eq!(watch.await.unwrap().unwrap(), expected);
            assert_eq!(service.client_count(&btc()), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kline_scopes_are_per_interval() {
        let catalog = StaticSymbolCatalog::with_symbols(&[venue()], &["BTC/USDT".to_string()]);
        let service: FanoutService<CanonicalKline> =
            FanoutService::new(Arc::new(catalog), FanoutSettings::default());
        let feed = Arc::new(FakeFeed::new(venue()));
        let (_tx, rx) = broadcast::channel(8);
        service.attach(feed.clone(), rx);

        let _m1 = service.acquire(venue(), "BTC/USDT", Some(Interval::M1)).unwrap();
        let _h1 = service.acquire(venue(), "BTC/USDT", Some(Interval::H1)).unwrap();

        assert_eq!(service.scope_count(), 2);
        assert_eq!(
            feed.ops(),
            vec![
                Op::Subscribe(FeedChannel::Klines(Interval::M1), vec!["BTCUSDT".to_string()]),
                Op::Subscribe(FeedChannel::Klines(Interval::H1), vec!["BTCUSDT".to_string()]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_open_subscriptions() {
        let (service, feed, _tx) = service();
        let mut subscription = service.acquire(venue(), "BTC/USDT", None).unwrap();
        service.shutdown();

        assert!(matches!(subscription.recv().await, Err(RecvError::Closed)));
        assert_eq!(service.scope_count(), 0);
        assert_eq!(feed.ops(), vec![sub("BTCUSDT"), unsub("BTCUSDT")]);
    }

    #[tokio::test(start_paused = true)]
    async fn services_sharing_upstream_unsubscribe_with_the_last_holder() {
        let (prices, feed, _tx) = service();
        let catalog = StaticSymbolCatalog::with_symbols(&[venue()], &["BTC/USDT".to_string()]);
        let trades: FanoutService<CanonicalTrade> = FanoutService::with_upstream(
            Arc::new(catalog),
            Arc::clone(prices.upstream()),
            FanoutSettings::default(),
        );
        let (_trade_tx, trade_rx) = broadcast::channel(8);
        trades.attach(feed.clone(), trade_rx);

        let price_sub = prices.acquire(venue(), "BTC/USDT", None).unwrap();
        let trade_sub = trades.acquire(venue(), "BTC/USDT", None).unwrap();
        assert_eq!(feed.ops(), vec![sub("BTCUSDT")]);

        drop(price_sub);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(prices.scope_count(), 0);
        assert_eq!(feed.ops(), vec![sub("BTCUSDT")]);

        drop(trade_sub);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(feed.ops(), vec![sub("BTCUSDT"), unsub("BTCUSDT")]);
    }
}
