//! Exchange Adapters
//!
//! Each exchange's wire protocol behind one small interface. The link state
//! machine is written once and parameterized by an adapter that knows:
//!
//! - the endpoint address
//! - the keep-alive frame
//! - how to build (un)subscribe frames and how many symbols fit in one
//! - how to classify inbound frames into trades, klines, pongs and acks
//!
//! # Adapters
//!
//! - `binance`: spot and USD-M perpetual (`trade`, `aggTrade`, `kline`)
//! - `okx`: public endpoint for trades, business endpoint for candles
//! - `bybit`: v5 public spot/linear (`publicTrade`, `kline`)

use std::fmt;
use std::sync::Arc;

use crate::domain::link::{ChannelKind, FeedChannel};
use crate::domain::market::{ExchangeId, RawKline, RawTick, Venue};

/// Binance adapter.
pub mod binance;

/// Bybit adapter.
pub mod bybit;

/// OKX adapter.
pub mod okx;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use okx::{OkxAdapter, OkxEndpoint};

// =============================================================================
// Error Type
// =============================================================================

/// Frame encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame does not have the expected shape.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    /// The exchange reported an error for a request.
    #[error("exchange error {code}: {message}")]
    Exchange {
        /// Exchange error code.
        code: String,
        /// Exchange error message.
        message: String,
    },

    /// The adapter cannot serve this channel.
    #[error("unsupported channel: {0}")]
    UnsupportedChannel(FeedChannel),
}

// =============================================================================
// Adapter Interface
// =============================================================================

/// Wire-level subscription operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Subscribe.
    Subscribe,
    /// Unsubscribe.
    Unsubscribe,
}

/// A classified inbound frame element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A trade.
    Trade(RawTick),
    /// A kline update.
    Kline(RawKline),
    /// Reply to an application-level ping.
    Pong,
    /// Acknowledgement of a request.
    Ack,
    /// Recognized but irrelevant frame.
    Ignored,
}

/// Exchange-specific protocol hooks used by the link state machine.
pub trait ExchangeAdapter: Send + Sync + fmt::Debug {
    /// Venue served by this adapter.
    fn venue(&self) -> Venue;

    /// WebSocket endpoint.
    fn url(&self) -> &str;

    /// Application-level keep-alive frame. `None` means a WebSocket ping.
    fn ping_frame(&self) -> Option<String>;

    /// Per-frame symbol limit imposed by the exchange, if any.
    fn max_symbols_per_frame(&self) -> Option<usize>;

    /// Channel kinds reachable through this adapter's endpoint.
    fn channel_kinds(&self) -> &'static [ChannelKind] {
        &[ChannelKind::Trades, ChannelKind::Klines]
    }

    /// Build one (un)subscribe frame for `symbols` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not served or encoding fails.
    fn operation_frame(
        &self,
        op: Operation,
        channel: FeedChannel,
        symbols: &[String],
    ) -> Result<String, CodecError>;

    /// Classify one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for unparsable frames and exchange-reported errors.
    fn decode(&self, text: &str) -> Result<Vec<Inbound>, CodecError>;
}

/// Default production adapters for a venue.
///
/// Binance and Bybit serve trades and klines on one endpoint; OKX splits them
/// across its public and business endpoints.
#[must_use]
pub fn adapters_for(venue: Venue) -> Vec<Arc<dyn ExchangeAdapter>> {
    match venue.exchange {
        ExchangeId::Binance => vec![Arc::new(BinanceAdapter::new(venue.market))],
        ExchangeId::Bybit => vec![Arc::new(BybitAdapter::new(venue.market))],
        ExchangeId::Okx => vec![
            Arc::new(OkxAdapter::new(venue.market, OkxEndpoint::Public)),
            Arc::new(OkxAdapter::new(venue.market, OkxEndpoint::Business)),
        ],
    }
}

/// Shorten a frame for logging.
pub(crate) fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map_or(text.len(), |(index, _)| index);
    &text[..end]
}
