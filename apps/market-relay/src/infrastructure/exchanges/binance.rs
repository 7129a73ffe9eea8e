//! Binance WebSocket protocol.
//!
//! - Spot: `wss://stream.binance.com:9443/ws`, trades on `<symbol>@trade`
//! - USD-M perpetual: `wss://fstream.binance.com/ws`, trades on
//!   `<symbol>@aggTrade`
//! - Klines on `<symbol>@kline_<interval>` for both
//!
//! Requests are `{"method":"SUBSCRIBE","params":[...],"id":n}` and are
//! acknowledged with `{"result":null,"id":n}`. The server pings at the
//! WebSocket level; the client keeps the connection warm with WebSocket pings.

use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CodecError, ExchangeAdapter, Inbound, Operation};
use crate::domain::link::FeedChannel;
use crate::domain::market::{ExchangeId, Interval, MarketKind, RawKline, RawTick, Side, Venue};

const SPOT_URL: &str = "wss://stream.binance.com:9443/ws";
const PERPETUAL_URL: &str = "wss://fstream.binance.com/ws";

/// Binance spot / USD-M perpetual adapter.
#[derive(Debug)]
pub struct BinanceAdapter {
    market: MarketKind,
    url: String,
    next_id: AtomicU64,
}

impl BinanceAdapter {
    /// Adapter for the production endpoint of a market.
    #[must_use]
    pub fn new(market: MarketKind) -> Self {
        let url = match market {
            MarketKind::Spot => SPOT_URL,
            MarketKind::Perpetual => PERPETUAL_URL,
        };
        Self::with_url(market, url)
    }

    /// Adapter for a custom endpoint.
    #[must_use]
    pub fn with_url(market: MarketKind, url: impl Into<String>) -> Self {
        Self {
            market,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn stream_name(&self, channel: FeedChannel, symbol: &str) -> String {
        let symbol = symbol.to_lowercase();
        match (channel, self.market) {
            (FeedChannel::Trades, MarketKind::Spot) => format!("{symbol}@trade"),
            (FeedChannel::Trades, MarketKind::Perpetual) => format!("{symbol}@aggTrade"),
            (FeedChannel::Klines(interval), _) => format!("{symbol}@kline_{interval}"),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct Request<'a> {
    method: &'a str,
    params: Vec<String>,
    id: u64,
}

/// `trade` and `aggTrade` events share every field the relay needs.
#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t", alias = "a")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlineData,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "V")]
    taker_buy_volume: Decimal,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: Decimal,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    closed: bool,
}

impl From<TradeEvent> for RawTick {
    fn from(event: TradeEvent) -> Self {
        Self {
            raw_symbol: event.symbol,
            price: event.price,
            size: event.quantity,
            amount: None,
            side: if event.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            },
            trade_id: event.trade_id.to_string(),
            ts: event.trade_time,
            block_hint: false,
        }
    }
}

impl TryFrom<KlineData> for RawKline {
    type Error = CodecError;

    fn try_from(k: KlineData) -> Result<Self, Self::Error> {
        let interval = Interval::parse(&k.interval)
            .ok_or_else(|| CodecError::InvalidFormat(format!("unknown interval {}", k.interval)))?;
        Ok(Self {
            raw_symbol: k.symbol,
            interval,
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            size: k.volume,
            amount: Some(k.quote_volume),
            buy_size: Some(k.taker_buy_volume),
            buy_amount: Some(k.taker_buy_quote_volume),
            trade_count: Some(k.trade_count),
            closed: k.closed,
        })
    }
}

// =============================================================================
// Adapter
// =============================================================================

impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> Venue {
        Venue::new(ExchangeId::Binance, self.market)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn ping_frame(&self) -> Option<String> {
        None
    }

    fn max_symbols_per_frame(&self) -> Option<usize> {
        None
    }

    fn operation_frame(
        &self,
        op: Operation,
        channel: FeedChannel,
        symbols: &[String],
    ) -> Result<String, CodecError> {
        let request = Request {
            method: match op {
                Operation::Subscribe => "SUBSCRIBE",
                Operation::Unsubscribe => "UNSUBSCRIBE",
            },
            params: symbols
                .iter()
                .map(|symbol| self.stream_name(channel, symbol))
                .collect(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        Ok(serde_json::to_string(&request)?)
    }

    fn decode(&self, text: &str) -> Result<Vec<Inbound>, CodecError> {
        let mut value: Value = serde_json::from_str(text)?;

        // Combined-stream envelope: {"stream": "...", "data": {...}}
        if value.get("stream").is_some()
            && let Some(data) = value.get_mut("data")
        {
            value = data.take();
        }

        if let Some(error) = value.get("error") {
            return Err(CodecError::Exchange {
                code: error.get("code").map(ToString::to_string).unwrap_or_default(),
                message: error
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        if value.get("id").is_some() && value.get("result").is_some() {
            return Ok(vec![Inbound::Ack]);
        }

        let inbound = match value.get("e").and_then(Value::as_str) {
            Some("trade" | "aggTrade") => {
                let event: TradeEvent = serde_json::from_value(value)?;
                Inbound::Trade(event.into())
            }
            Some("kline") => {
                let event: KlineEvent = serde_json::from_value(value)?;
                Inbound::Kline(event.kline.try_into()?)
            }
            _ => Inbound::Ignored,
        };
        Ok(vec![inbound])
    }
}
