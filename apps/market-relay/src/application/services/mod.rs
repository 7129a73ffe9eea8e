//! Application Services
//!
//! Long-running services between the links and the consumers: the tick
//! normalizer, the kline normalizer with its windows, and the subscription
//! fan-out with the upstream interest its services share.

mod fanout;
mod kline;
mod ticker;
mod upstream;

pub use fanout::{
    FanoutError, FanoutService, PriceBounds, PricedRecord, ScopeSubscription, ScopedRecord,
    WatchOutcome,
};
pub use kline::{KlineNormalizer, KlineWindow, normalize_kline};
pub use ticker::{PriceState, TickOutput, TickerConfig, TickerHandler, TickerSink};
pub use upstream::UpstreamInterest;
