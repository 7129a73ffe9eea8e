//! Kline Normalizer and Window
//!
//! Raw exchange klines become canonical klines with a buy/sell split, and a
//! `KlineWindow` keeps a bounded, ordered history per (symbol, interval) that
//! is rolled forward live, backfilled from history and patched by
//! corrections.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{HistoryError, KlineHistory, PubSub, SymbolCatalog, SymbolMapping};
use crate::domain::market::{CanonicalKline, Interval, RawKline, Venue, now_ms};
use crate::domain::series::{MergeOptions, SeriesStore};
use crate::infrastructure::channel::topics;

// =============================================================================
// Normalization
// =============================================================================

/// Build a canonical kline from a raw kline and its resolved mapping.
///
/// Missing quote volume is estimated from the close. The sell side is the
/// total minus the taker-buy side when the exchange reports it, zero
/// otherwise.
#[must_use]
pub fn normalize_kline(venue: Venue, raw: RawKline, mapping: &SymbolMapping) -> CanonicalKline {
    let amount = raw.amount.unwrap_or(raw.size * raw.close);
    let (buy_size, sell_size) = raw
        .buy_size
        .map_or((Decimal::ZERO, Decimal::ZERO), |buy| (buy, raw.size - buy));
    let (buy_amount, sell_amount) = raw
        .buy_amount
        .map_or((Decimal::ZERO, Decimal::ZERO), |buy| (buy, amount - buy));

    CanonicalKline {
        exchange: venue.exchange,
        market: mapping.market,
        symbol: mapping.unified_symbol.clone(),
        interval: raw.interval,
        open_time: raw.open_time,
        open: raw.open,
        high: raw.high,
        low: raw.low,
        close: raw.close,
        size: raw.size,
        amount,
        buy_size,
        buy_amount,
        sell_size,
        sell_amount,
        trade_count: raw.trade_count.unwrap_or(0),
        is_live: !raw.closed,
    }
}

/// Kline normalizer for one venue.
pub struct KlineNormalizer {
    venue: Venue,
    catalog: Arc<dyn SymbolCatalog>,
}

impl KlineNormalizer {
    /// Create a normalizer for `venue`.
    #[must_use]
    pub fn new(venue: Venue, catalog: Arc<dyn SymbolCatalog>) -> Self {
        Self { venue, catalog }
    }

    /// Resolve and normalize one raw kline. Unknown symbols are dropped.
    #[must_use]
    pub fn normalize(&self, raw: RawKline) -> Option<CanonicalKline> {
        let Some(mapping) = self.catalog.resolve(self.venue, &raw.raw_symbol) else {
            tracing::trace!(
                exchange = %self.venue.exchange,
                raw_symbol = %raw.raw_symbol,
                "Unresolved symbol, kline dropped"
            );
            return None;
        };
        Some(normalize_kline(self.venue, raw, &mapping))
    }

    /// Consume raw klines until cancelled or the source closes.
    pub async fn run(
        self,
        mut source: broadcast::Receiver<RawKline>,
        sink: Arc<dyn PubSub<CanonicalKline>>,
        cancel: CancellationToken,
    ) {
        let topic = topics::klines(self.venue);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = source.recv() => match received {
                    Ok(raw) => {
                        if let Some(kline) = self.normalize(raw) {
                            sink.publish(&topic, kline);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            exchange = %self.venue.exchange,
                            skipped,
                            "Kline normalizer lagged, raw klines dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

// =============================================================================
// Kline Window
// =============================================================================

/// Bounded, ordered kline history for one (venue, symbol, interval).
#[derive(Debug)]
pub struct KlineWindow {
    venue: Venue,
    symbol: String,
    interval: Interval,
    store: SeriesStore<CanonicalKline>,
    trigger_count: usize,
    keep_count: usize,
}

impl KlineWindow {
    /// Create an empty window trimmed to `keep_count` once it reaches
    /// `trigger_count`.
    #[must_use]
    pub fn new(
        venue: Venue,
        symbol: impl Into<String>,
        interval: Interval,
        trigger_count: usize,
        keep_count: usize,
    ) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            interval,
            store: SeriesStore::new(),
            trigger_count: trigger_count.max(keep_count),
            keep_count,
        }
    }

    /// The underlying series.
    #[must_use]
    pub const fn store(&self) -> &SeriesStore<CanonicalKline> {
        &self.store
    }

    /// Whether a kline belongs to this window.
    #[must_use]
    pub fn accepts(&self, kline: &CanonicalKline) -> bool {
        kline.exchange == self.venue.exchange
            && kline.market == self.venue.market
            && kline.interval == self.interval
            && kline.symbol == self.symbol
    }

    /// Roll forward with a live update, replacing the kline at the same
    /// open time.
    pub fn apply_live(&mut self, kline: CanonicalKline) {
        if !self.accepts(&kline) {
            return;
        }
        self.store.append(vec![kline], MergeOptions::duplicated());
        self.store
            .check_and_strip(self.trigger_count, self.keep_count);
    }

    /// Replace klines at known open times, wherever they sit.
    pub fn apply_correction(&mut self, klines: Vec<CanonicalKline>) {
        let klines = klines.into_iter().filter(|k| self.accepts(k)).collect();
        self.store.patch(klines);
    }

    /// Backfill up to `limit` klines older than the oldest one held.
    ///
    /// Returns the number of klines fetched.
    ///
    /// # Errors
    ///
    /// Returns the history backend's error; the window is left unchanged.
    pub async fn catch_up(
        &mut self,
        history: &dyn KlineHistory,
        limit: usize,
    ) -> Result<usize, HistoryError> {
        let end_ms = self
            .store
            .first_ts()
            .unwrap_or_else(|| now_ms() + self.interval.millis());
        let klines = history
            .fetch(self.venue, &self.symbol, self.interval, end_ms, limit)
            .await?;
        let fetched = klines.len();

        self.store
            .prepend(klines, MergeOptions::duplicated().with_sort(true));
        tracing::debug!(
            exchange = %self.venue.exchange,
            symbol = %self.symbol,
            interval = %self.interval,
            fetched,
            held = self.store.len(),
            "Kline window backfilled"
        );
        Ok(fetched)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::market::{ExchangeId, MarketKind};

    fn venue() -> Venue {
        Venue::new(ExchangeId::Binance, MarketKind::Spot)
    }

    fn mapping() -> SymbolMapping {
        SymbolMapping {
            unified_symbol: "BTC/USDT".to_string(),
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            market: MarketKind::Spot,
            contract: None,
        }
    }

    fn raw(open_time: i64) -> RawKline {
        RawKline {
            raw_symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            open_time,
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            size: dec!(10),
            amount: Some(dec!(1040)),
            buy_size: Some(dec!(6)),
            buy_amount: Some(dec!(630)),
            trade_count: Some(42),
            closed: false,
        }
    }

    fn kline(open_time: i64, close: Decimal) -> CanonicalKline {
        let mut raw = raw(open_time);
        raw.close = close;
        normalize_kline(venue(), raw, &mapping())
    }

    #[test]
    fn sell_side_is_total_minus_buy() {
        let kline = normalize_kline(venue(), raw(0), &mapping());
        assert_eq!(kline.buy_size, dec!(6));
        assert_eq!(kline.sell_size, dec!(4));
        assert_eq!(kline.buy_amount, dec!(630));
        assert_eq!(kline.sell_amount, dec!(410));
        assert_eq!(kline.trade_count, 42);
        assert!(kline.is_live);
        assert_eq!(kline.symbol, "BTC/USDT");
    }

    #[test]
    fn missing_taker_volume_splits_to_zero() {
        let mut raw = raw(0);
        raw.buy_size = None;
        raw.buy_amount = None;
        raw.amount = None;
        raw.trade_count = None;
        raw.closed = true;

        let kline = normalize_kline(venue(), raw, &mapping());
        assert_eq!(kline.amount, dec!(1050));
        assert_eq!(kline.buy_size, Decimal::ZERO);
        assert_eq!(kline.sell_size, Decimal::ZERO);
        assert_eq!(kline.trade_count, 0);
        assert!(!kline.is_live);
    }

    #[test]
    fn live_updates_replace_current_kline_and_trim() {
        let mut window = KlineWindow::new(venue(), "BTC/USDT", Interval::M1, 4, 2);
        window.apply_live(kline(0, dec!(1)));
        window.apply_live(kline(60_000, dec!(2)));
        window.apply_live(kline(60_000, dec!(3)));

        assert_eq!(window.store().len(), 2);
        assert_eq!(window.store().as_slice()[1].close, dec!(3));

        window.apply_live(kline(120_000, dec!(4)));
        window.apply_live(kline(180_000, dec!(5)));
        let times: Vec<i64> = window.store().as_slice().iter().map(|k| k.open_time).collect();
        assert_eq!(times, vec![120_000, 180_000]);
    }

    #[test]
    fn foreign_klines_are_ignored() {
        let mut window = KlineWindow::new(venue(), "ETH/USDT", Interval::M1, 10, 5);
        window.apply_live(kline(0, dec!(1)));
        assert!(window.store().is_empty());
    }

    #[test]
    fn corrections_patch_in_place() {
        let mut window = KlineWindow::new(venue(), "BTC/USDT", Interval::M1, 10, 5);
        for t in [0, 60_000, 120_000] {
            window.apply_live(kline(t, dec!(1)));
        }
        window.apply_correction(vec![kline(60_000, dec!(9))]);

        let closes: Vec<Decimal> = window.store().as_slice().iter().map(|k| k.close).collect();
        assert_eq!(closes, vec![dec!(1), dec!(9), dec!(1)]);
    }

    struct FixedHistory(Vec<CanonicalKline>);

    #[async_trait]
    impl KlineHistory for FixedHistory {
        async fn fetch(
            &self,
            _venue: Venue,
            _symbol: &str,
            _interval: Interval,
            end_ms: i64,
            limit: usize,
        ) -> Result<Vec<CanonicalKline>, HistoryError> {
            let mut older: Vec<CanonicalKline> = self
                .0
                .iter()
                .filter(|k| k.open_time < end_ms)
                .cloned()
                .collect();
            let skip = older.len().saturating_sub(limit);
            Ok(older.split_off(skip))
        }
    }

    struct DownHistory;

    #[async_trait]
    impl KlineHistory for DownHistory {
        async fn fetch(
            &self,
            _venue: Venue,
            _symbol: &str,
            _interval: Interval,
            _end_ms: i64,
            _limit: usize,
        ) -> Result<Vec<CanonicalKline>, HistoryError> {
            Err(HistoryError::Unavailable {
                message: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn catch_up_prepends_older_history() {
        let history = FixedHistory((0..5).map(|i| kline(i * 60_000, dec!(1))).collect());
        let mut window = KlineWindow::new(venue(), "BTC/USDT", Interval::M1, 100, 50);
        window.apply_live(kline(240_000, dec!(7)));

        let fetched = window.catch_up(&history, 2).await.unwrap();
        assert_eq!(fetched, 2);
        let times: Vec<i64> = window.store().as_slice().iter().map(|k| k.open_time).collect();
        assert_eq!(times, vec![120_000, 180_000, 240_000]);
        assert_eq!(window.store().as_slice()[2].close, dec!(7));
    }

    #[tokio::test]
    async fn catch_up_failure_leaves_window_untouched() {
        let mut window = KlineWindow::new(venue(), "BTC/USDT", Interval::M1, 100, 50);
        window.apply_live(kline(0, dec!(1)));
        assert!(window.catch_up(&DownHistory, 10).await.is_err());
        assert_eq!(window.store().len(), 1);
    }

    #[tokio::test]
    async fn normalizer_publishes_on_kline_topic() {
        use crate::infrastructure::channel::InProcessBus;

        let catalog = crate::infrastructure::catalog::StaticSymbolCatalog::with_symbols(
            &[venue()],
            &["BTC/USDT".to_string()],
        );
        let bus: Arc<InProcessBus<CanonicalKline>> = Arc::new(InProcessBus::new(8));
        let mut rx = bus.subscribe(&topics::klines(venue()));

        let (tx, source) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let normalizer = KlineNormalizer::new(venue(), Arc::new(catalog));
        let task = tokio::spawn(normalizer.run(source, bus.clone(), cancel.clone()));

        let mut unknown = raw(0);
        unknown.raw_symbol = "XYZUSDT".to_string();
        tx.send(unknown).unwrap();
        tx.send(raw(60_000)).unwrap();

        assert_eq!(rx.recv().await.unwrap().open_time, 60_000);
        cancel.cancel();
        task.await.unwrap();
    }
}
