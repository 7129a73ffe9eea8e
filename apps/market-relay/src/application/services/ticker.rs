//! Tick Normalizer
//!
//! Turns raw exchange trades into canonical trades, filters price spikes and
//! coalesces unchanged prices before republishing.
//!
//! # Spike Filter
//!
//! A trade is rejected when all of the following hold:
//! - the symbol has an accepted price
//! - that price is positive
//! - the trade is within the spike window of the accepted one
//! - the rejected streak is below its limit
//! - the move relative to the accepted price reaches the threshold
//!
//! Rejections compare against the last *accepted* price and leave it
//! untouched, so a sustained move is accepted once the window lapses.
//!
//! # Price Coalescing
//!
//! An accepted trade emits a price tick unless the price equals the last
//! emitted one and the dedup window has not elapsed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{PubSub, SymbolCatalog, SymbolMapping};
use crate::domain::market::{CanonicalPriceTick, CanonicalTrade, RawTick, Venue};
use crate::infrastructure::channel::topics;
use crate::infrastructure::config::TickerSettings;
use crate::infrastructure::metrics::{self, TickOutcome};

/// Streak at which the spike filter stops rejecting.
const MAX_REJECTED_STREAK: u32 = 3;

// =============================================================================
// Configuration
// =============================================================================

/// Tick normalizer configuration.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Window (ms) after an accepted tick in which spikes are rejected.
    pub spike_window_ms: i64,
    /// Relative move (percent) that counts as a spike.
    pub spike_threshold_pct: Decimal,
    /// Window (ms) in which an unchanged price is not re-emitted.
    pub price_dedup_ms: i64,
    /// Notional above which a trade is a block trade.
    pub block_notional: Decimal,
    /// Log throughput after this many messages.
    pub log_every_messages: u64,
    /// Log throughput at least this often.
    pub log_every: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self::from_settings(&TickerSettings::default())
    }
}

impl TickerConfig {
    /// Create configuration from `TickerSettings`.
    #[must_use]
    pub fn from_settings(settings: &TickerSettings) -> Self {
        Self {
            spike_window_ms: settings.spike_window_ms,
            spike_threshold_pct: settings.spike_threshold_pct,
            price_dedup_ms: settings.price_dedup_ms,
            block_notional: settings.block_notional,
            log_every_messages: 1_000,
            log_every: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Last accepted price of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceState {
    /// Time of the last accepted trade (ms).
    pub last_ts: i64,
    /// Last accepted price.
    pub last_price: Decimal,
    /// Consecutive rejections. Reset on every accepted trade.
    pub rejected_streak: u32,
}

#[derive(Debug, Clone, Copy)]
struct Emitted {
    price: Decimal,
    time: i64,
}

/// Message counter that reports every N messages or every interval.
#[derive(Debug)]
struct Throughput {
    count: u64,
    window_start: Instant,
    every_messages: u64,
    every: Duration,
}

impl Throughput {
    fn new(every_messages: u64, every: Duration) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            every_messages: every_messages.max(1),
            every,
        }
    }

    /// Count one message; returns the window when it is due for logging.
    fn record(&mut self) -> Option<(u64, Duration)> {
        self.count += 1;
        let elapsed = self.window_start.elapsed();
        if self.count < self.every_messages && elapsed < self.every {
            return None;
        }
        let window = (self.count, elapsed);
        self.count = 0;
        self.window_start = Instant::now();
        Some(window)
    }
}

/// Destinations of the normalizer's output.
#[derive(Clone)]
pub struct TickerSink {
    /// Price tick backend.
    pub prices: Arc<dyn PubSub<CanonicalPriceTick>>,
    /// Canonical trade backend.
    pub trades: Arc<dyn PubSub<CanonicalTrade>>,
}

/// Result of handling one raw trade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutput {
    /// Accepted canonical trade.
    pub trade: Option<CanonicalTrade>,
    /// Price tick to publish.
    pub price: Option<CanonicalPriceTick>,
}

// =============================================================================
// Ticker Handler
// =============================================================================

/// Tick normalizer for one venue.
pub struct TickerHandler {
    venue: Venue,
    catalog: Arc<dyn SymbolCatalog>,
    config: TickerConfig,
    states: HashMap<String, PriceState>,
    emitted: HashMap<String, Emitted>,
    throughput: Throughput,
}

impl TickerHandler {
    /// Create a handler for `venue`.
    #[must_use]
    pub fn new(venue: Venue, catalog: Arc<dyn SymbolCatalog>, config: TickerConfig) -> Self {
        let throughput = Throughput::new(config.log_every_messages, config.log_every);
        Self {
            venue,
            catalog,
            config,
            states: HashMap::new(),
            emitted: HashMap::new(),
            throughput,
        }
    }

    /// Venue served.
    #[must_use]
    pub const fn venue(&self) -> Venue {
        self.venue
    }

    /// Accepted price state of a unified symbol.
    #[must_use]
    pub fn price_state(&self, symbol: &str) -> Option<PriceState> {
        self.states.get(symbol).copied()
    }

    /// Build a canonical trade from a raw trade and its resolved mapping.
    ///
    /// Products that overflow `Decimal` saturate, so an absurd notional is
    /// flagged as a block trade instead of aborting the normalizer.
    #[must_use]
    pub fn normalize(&self, tick: RawTick, mapping: &SymbolMapping) -> CanonicalTrade {
        let (size, amount) = match mapping.contract {
            Some(contract) if contract.inverse => {
                let amount = tick.size.saturating_mul(contract.size);
                let size = if tick.price.is_zero() {
                    Decimal::ZERO
                } else {
                    amount.checked_div(tick.price).unwrap_or(Decimal::MAX)
                };
                (size, amount)
            }
            Some(contract) => {
                let size = tick.size.saturating_mul(contract.size);
                (size, tick.amount.unwrap_or_else(|| tick.price.saturating_mul(size)))
            }
            None => (
                tick.size,
                tick.amount.unwrap_or_else(|| tick.price.saturating_mul(tick.size)),
            ),
        };

        CanonicalTrade {
            exchange: self.venue.exchange,
            market: mapping.market,
            symbol: mapping.unified_symbol.clone(),
            base: mapping.base.clone(),
            quote: mapping.quote.clone(),
            time: tick.ts,
            price: tick.price,
            size,
            amount,
            trade_id: tick.trade_id,
            side: tick.side,
            is_block: tick.block_hint || amount > self.config.block_notional,
        }
    }

    /// Run the spike filter, updating the price state on acceptance.
    ///
    /// A change too large to represent counts as a spike.
    pub fn is_price_accepted(&mut self, trade: &CanonicalTrade) -> bool {
        if let Some(state) = self.states.get(&trade.symbol)
            && state.last_price > Decimal::ZERO
            && trade.time.saturating_sub(state.last_ts) < self.config.spike_window_ms
            && state.rejected_streak < MAX_REJECTED_STREAK
        {
            let change_pct = trade
                .price
                .checked_sub(state.last_price)
                .and_then(|delta| delta.abs().checked_div(state.last_price))
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED));
            if change_pct.is_none_or(|pct| pct >= self.config.spike_threshold_pct) {
                tracing::warn!(
                    exchange = %self.venue.exchange,
                    symbol = %trade.symbol,
                    last_price = %state.last_price,
                    price = %trade.price,
                    change_pct = ?change_pct.map(|pct| pct.round_dp(4)),
                    "Price spike rejected"
                );
                return false;
            }
        }

        self.states.insert(
            trade.symbol.clone(),
            PriceState {
                last_ts: trade.time,
                last_price: trade.price,
                rejected_streak: 0,
            },
        );
        true
    }

    /// Derive a price tick from an accepted trade, unless coalesced.
    pub fn to_price_tick(&mut self, trade: &CanonicalTrade) -> Option<CanonicalPriceTick> {
        if self
            .states
            .get(&trade.symbol)
            .is_some_and(|state| state.rejected_streak > 0)
        {
            return None;
        }
        if let Some(last) = self.emitted.get(&trade.symbol)
            && last.price == trade.price
            && trade.time - last.time < self.config.price_dedup_ms
        {
            return None;
        }

        self.emitted.insert(
            trade.symbol.clone(),
            Emitted {
                price: trade.price,
                time: trade.time,
            },
        );
        Some(CanonicalPriceTick {
            exchange: trade.exchange,
            symbol: trade.symbol.clone(),
            base: trade.base.clone(),
            price: trade.price,
            time: trade.time,
        })
    }

    /// Resolve, normalize, filter and coalesce one raw trade.
    pub fn handle(&mut self, tick: RawTick) -> TickOutput {
        let exchange = self.venue.exchange;
        let Some(mapping) = self.catalog.resolve(self.venue, &tick.raw_symbol) else {
            tracing::trace!(
                exchange = %exchange,
                raw_symbol = %tick.raw_symbol,
                "Unresolved symbol, tick dropped"
            );
            metrics::record_tick(exchange, TickOutcome::Unresolved);
            return TickOutput::default();
        };

        let trade = self.normalize(tick, &mapping);
        if !self.is_price_accepted(&trade) {
            metrics::record_tick(exchange, TickOutcome::Rejected);
            return TickOutput::default();
        }
        metrics::record_tick(exchange, TickOutcome::Accepted);

        let price = self.to_price_tick(&trade);
        if price.is_none() {
            metrics::record_tick(exchange, TickOutcome::Suppressed);
        }
        TickOutput {
            trade: Some(trade),
            price,
        }
    }

    /// Publish a handler output on the venue's topics.
    pub fn publish(&mut self, output: TickOutput, sink: &TickerSink) {
        if let Some(trade) = output.trade {
            sink.trades.publish(&topics::trades(self.venue), trade);
        }
        if let Some(tick) = output.price {
            metrics::record_price_tick_published(self.venue.exchange);
            sink.prices.publish(&topics::prices(self.venue), tick);
        }

        if let Some((count, elapsed)) = self.throughput.record() {
            tracing::info!(
                exchange = %self.venue.exchange,
                market = %self.venue.market,
                messages = count,
                elapsed_ms = elapsed.as_millis(),
                symbols = self.states.len(),
                "Ticker throughput"
            );
        }
    }

    /// Consume raw trades until cancelled or the source closes.
    pub async fn run(
        mut self,
        mut source: broadcast::Receiver<RawTick>,
        sink: TickerSink,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = source.recv() => match received {
                    Ok(tick) => {
                        let output = self.handle(tick);
                        self.publish(output, &sink);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            exchange = %self.venue.exchange,
                            skipped,
                            "Ticker lagged, raw trades dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!(exchange = %self.venue.exchange, "Ticker handler stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
