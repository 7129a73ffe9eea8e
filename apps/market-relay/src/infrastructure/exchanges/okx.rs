//! OKX v5 WebSocket protocol.
//!
//! OKX routes trades and candles to different endpoints:
//!
//! - Public (`/ws/v5/public`): `trades`
//! - Business (`/ws/v5/business`): `candle<bar>`
//!
//! Requests are `{"op":"subscribe","args":[{"channel":...,"instId":...}]}`.
//! Keep-alive is the literal text `ping`, answered with `pong`. Swap trade
//! sizes are in contracts; candle `volCcy` is already in base units.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CodecError, ExchangeAdapter, Inbound, Operation};
use crate::domain::link::{ChannelKind, FeedChannel};
use crate::domain::market::{ExchangeId, Interval, MarketKind, RawKline, RawTick, Side, Venue};

const PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const BUSINESS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

/// OKX endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OkxEndpoint {
    /// Public endpoint (trades).
    Public,
    /// Business endpoint (candles).
    Business,
}

/// OKX spot / swap adapter for one endpoint.
#[derive(Debug)]
pub struct OkxAdapter {
    market: MarketKind,
    endpoint: OkxEndpoint,
    url: String,
}

impl OkxAdapter {
    /// Adapter for the production endpoint.
    #[must_use]
    pub fn new(market: MarketKind, endpoint: OkxEndpoint) -> Self {
        let url = match endpoint {
            OkxEndpoint::Public => PUBLIC_URL,
            OkxEndpoint::Business => BUSINESS_URL,
        };
        Self::with_url(market, endpoint, url)
    }

    /// Adapter for a custom endpoint.
    #[must_use]
    pub fn with_url(market: MarketKind, endpoint: OkxEndpoint, url: impl Into<String>) -> Self {
        Self {
            market,
            endpoint,
            url: url.into(),
        }
    }
}

const fn bar(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1m",
        Interval::M5 => "5m",
        Interval::M15 => "15m",
        Interval::M30 => "30m",
        Interval::H1 => "1H",
        Interval::H4 => "4H",
        Interval::D1 => "1D",
    }
}

fn parse_bar(bar: &str) -> Option<Interval> {
    match bar {
        "1m" => Some(Interval::M1),
        "5m" => Some(Interval::M5),
        "15m" => Some(Interval::M15),
        "30m" => Some(Interval::M30),
        "1H" => Some(Interval::H1),
        "4H" => Some(Interval::H4),
        "1D" => Some(Interval::D1),
        _ => None,
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct Request<'a> {
    op: &'a str,
    args: Vec<Arg>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Arg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct Push {
    arg: Arg,
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Trade {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
    px: Decimal,
    sz: Decimal,
    side: String,
    ts: String,
}

fn parse_ms(raw: &str) -> Result<i64, CodecError> {
    raw.parse()
        .map_err(|_| CodecError::InvalidFormat(format!("bad timestamp {raw}")))
}

fn parse_decimal(raw: &str) -> Result<Decimal, CodecError> {
    raw.parse()
        .map_err(|_| CodecError::InvalidFormat(format!("bad decimal {raw}")))
}

impl TryFrom<Trade> for RawTick {
    type Error = CodecError;

    fn try_from(trade: Trade) -> Result<Self, Self::Error> {
        let side = match trade.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => return Err(CodecError::InvalidFormat(format!("unknown side {other}"))),
        };
        Ok(Self {
            raw_symbol: trade.inst_id,
            price: trade.px,
            size: trade.sz,
            amount: None,
            side,
            trade_id: trade.trade_id,
            ts: parse_ms(&trade.ts)?,
            block_hint: false,
        })
    }
}

impl OkxAdapter {
    /// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
    fn candle(&self, inst_id: &str, interval: Interval, row: Value) -> Result<RawKline, CodecError> {
        let fields: Vec<String> = serde_json::from_value(row)?;
        if fields.len() < 9 {
            return Err(CodecError::InvalidFormat(format!(
                "candle has {} fields",
                fields.len()
            )));
        }

        let size = match self.market {
            MarketKind::Spot => parse_decimal(&fields[5])?,
            MarketKind::Perpetual => parse_decimal(&fields[6])?,
        };

        Ok(RawKline {
            raw_symbol: inst_id.to_string(),
            interval,
            open_time: parse_ms(&fields[0])?,
            open: parse_decimal(&fields[1])?,
            high: parse_decimal(&fields[2])?,
            low: parse_decimal(&fields[3])?,
            close: parse_decimal(&fields[4])?,
            size,
            amount: Some(parse_decimal(&fields[7])?),
            buy_size: None,
            buy_amount: None,
            trade_count: None,
            closed: fields[8] == "1",
        })
    }
}

// =============================================================================
// Adapter
// =============================================================================

impl ExchangeAdapter for OkxAdapter {
    fn venue(&self) -> Venue {
        Venue::new(ExchangeId::Okx, self.market)
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn ping_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn max_symbols_per_frame(&self) -> Option<usize> {
        None
    }

    fn channel_kinds(&self) -> &'static [ChannelKind] {
        match self.endpoint {
            OkxEndpoint::Public => &[ChannelKind::Trades],
            OkxEndpoint::Business => &[ChannelKind::Klines],
        }
    }

    fn operation_frame(
        &self,
        op: Operation,
        channel: FeedChannel,
        symbols: &[String],
    ) -> Result<String, CodecError> {
        if !self.channel_kinds().contains(&channel.kind()) {
            return Err(CodecError::UnsupportedChannel(channel));
        }

        let channel_name = match channel {
            FeedChannel::Trades => "trades".to_string(),
            FeedChannel::Klines(interval) => format!("candle{}", bar(interval)),
        };
        let request = Request {
            op: match op {
                Operation::Subscribe => "subscribe",
                Operation::Unsubscribe => "unsubscribe",
            },
            args: symbols
                .iter()
                .map(|symbol| Arg {
                    channel: channel_name.clone(),
                    inst_id: symbol.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&request)?)
    }

    fn decode(&self, text: &str) -> Result<Vec<Inbound>, CodecError> {
        if text == "pong" {
            return Ok(vec![Inbound::Pong]);
        }

        let value: Value = serde_json::from_str(text)?;

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            return match event {
                "subscribe" | "unsubscribe" => Ok(vec![Inbound::Ack]),
                "error" => Err(CodecError::Exchange {
                    code: value
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    message: value
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                _ => Ok(vec![Inbound::Ignored]),
            };
        }

        if value.get("data").is_none() {
            return Ok(vec![Inbound::Ignored]);
        }

        let push: Push = serde_json::from_value(value)?;
        if push.arg.channel == "trades" {
            return push
                .data
                .into_iter()
                .map(|row| -> Result<Inbound, CodecError> {
                    let trade: Trade = serde_json::from_value(row)?;
                    Ok(Inbound::Trade(trade.try_into()?))
                })
                .collect();
        }

        if let Some(interval) = push.arg.channel.strip_prefix("candle").and_then(parse_bar) {
            return push
                .data
                .into_iter()
                .map(|row| {
                    self.candle(&push.arg.inst_id, interval, row)
                        .map(Inbound::Kline)
                })
                .collect();
        }

        Ok(vec![Inbound::Ignored])
    }
}
