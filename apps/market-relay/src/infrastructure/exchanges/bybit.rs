//! Bybit v5 public WebSocket protocol.
//!
//! - Spot: `wss://stream.bybit.com/v5/public/spot`
//! - Linear perpetual: `wss://stream.bybit.com/v5/public/linear`
//!
//! Topics are `publicTrade.<symbol>` and `kline.<interval>.<symbol>`.
//! Requests are `{"op":"subscribe","args":[...]}` with at most 10 topics per
//! request. Keep-alive is `{"op":"ping"}`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CodecError, ExchangeAdapter, Inbound, Operation};
use crate::domain::link::FeedChannel;
use crate::domain::market::{ExchangeId, Interval, MarketKind, RawKline, RawTick, Side, Venue};

const SPOT_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const LINEAR_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const MAX_ARGS_PER_REQUEST: usize = 10;

/// Bybit spot / linear adapter.
#[derive(Debug)]
pub struct BybitAdapter {
    market: MarketKind,
    url: String,
}

impl BybitAdapter {
    /// Adapter for the production endpoint of a market.
    #[must_use]
    pub fn new(market: MarketKind) -> Self {
        let url = match market {
            MarketKind::Spot => SPOT_URL,
            MarketKind::Perpetual => LINEAR_URL,
        };
        Self::with_url(market, url)
    }

    /// Adapter for a custom endpoint.
    #[must_use]
    pub fn with_url(market: MarketKind, url: impl Into<String>) -> Self {
        Self {
            market,
            url: url.into(),
        }
    }
}

const fn interval_code(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1",
        Interval::M5 => "5",
        Interval::M15 => "15",
        Interval::M30 => "30",
        Interval::H1 => "60",
        Interval::H4 => "240",
        Interval::D1 => "D",
    }
}

fn parse_interval_code(code: &str) -> Option<Interval> {
    match code {
        "1" => Some(Interval::M1),
        "5" => Some(Interval::M5),
        "15" => Some(Interval::M15),
        "30" => Some(Interval::M30),
        "60" => Some(Interval::H1),
        "240" => Some(Interval::H4),
        "D" => Some(Interval::D1),
        _ => None,
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct Request<'a> {
    op: &'a str,
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Trade {
    #[serde(rename = "T")]
    time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "v")]
    size: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "i")]
    trade_id: String,
    #[serde(rename = "BT", default)]
    block_trade: bool,
}

#[derive(Debug, Deserialize)]
struct Kline {
    start: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    turnover: Decimal,
    confirm: bool,
}

impl TryFrom<Trade> for RawTick {
    type Error = CodecError;

    fn try_from(trade: Trade) -> Result<Self, Self::Error> {
        let side = match trade.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            other => return Err(CodecError::InvalidFormat(format!("unknown side {other}"))),
        };
        Ok(Self {
            raw_symbol: trade.symbol,
            price: trade.price,
            size: trade.size,
            amount: None,
            side,
            trade_id: trade.trade_id,
            ts: trade.time,
            block_hint: trade.block_trade,
        })
    }
}

fn kline(symbol: &str, interval: Interval, k: Kline) -> RawKline {
    RawKline {
        raw_symbol: symbol.to_string(),
        interval,
        open_time: k.start,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        size: k.volume,
        amount: Some(k.turnover),
        buy_size: None,
        buy_amount: None,
        trade_count: None,
        closed: k.confirm,
    }
}

// =============================================================================
// Adapter
// =============================================================================

impl ExchangeAdapter for BybitAdapter {
    fn venue(&self) -> Venue {
        Venue::new(ExchangeId::Bybit, self.market)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn ping_frame(&self) -> Option<String> {
        Some(r#"{"op":"ping"}"#.to_string())
    }

    fn max_symbols_per_frame(&self) -> Option<usize> {
        Some(MAX_ARGS_PER_REQUEST)
    }

    fn operation_frame(
        &self,
        op: Operation,
        channel: FeedChannel,
        symbols: &[String],
    ) -> Result<String, CodecError> {
        let args = symbols
            .iter()
            .map(|symbol| match channel {
                FeedChannel::Trades => format!("publicTrade.{symbol}"),
                FeedChannel::Klines(interval) => {
                    format!("kline.{}.{symbol}", interval_code(interval))
                }
            })
            .collect();
        let request = Request {
            op: match op {
                Operation::Subscribe => "subscribe",
                Operation::Unsubscribe => "unsubscribe",
            },
            args,
        };
        Ok(serde_json::to_string(&request)?)
    }

    fn decode(&self, text: &str) -> Result<Vec<Inbound>, CodecError> {
        let value: Value = serde_json::from_str(text)?;

        if let Some(op) = value.get("op").and_then(Value::as_str) {
            let success = value.get("success").and_then(Value::as_bool).unwrap_or(true);
            if !success {
                return Err(CodecError::Exchange {
                    code: op.to_string(),
                    message: value
                        .get("ret_msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return Ok(vec![match op {
                "ping" | "pong" => Inbound::Pong,
                _ => Inbound::Ack,
            }]);
        }

        let Some(topic) = value.get("topic").and_then(Value::as_str) else {
            return Ok(vec![Inbound::Ignored]);
        };
        let topic = topic.to_string();
        let data = value
            .get("data")
            .cloned()
            .ok_or_else(|| CodecError::InvalidFormat(format!("{topic} without data")))?;

        if topic.starts_with("publicTrade.") {
            let trades: Vec<Trade> = serde_json::from_value(data)?;
            return trades
                .into_iter()
                .map(|trade| RawTick::try_from(trade).map(Inbound::Trade))
                .collect();
        }

        if let Some(rest) = topic.strip_prefix("kline.") {
            let (code, symbol) = rest
                .split_once('.')
                .ok_or_else(|| CodecError::InvalidFormat(format!("bad topic {topic}")))?;
            let interval = parse_interval_code(code)
                .ok_or_else(|| CodecError::InvalidFormat(format!("bad interval {code}")))?;
            let klines: Vec<Kline> = serde_json::from_value(data)?;
            return Ok(klines
                .into_iter()
                .map(|k| Inbound::Kline(kline(symbol, interval, k)))
                .collect());
        }

        Ok(vec![Inbound::Ignored])
    }
}
