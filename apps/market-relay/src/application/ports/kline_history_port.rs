//! Kline History Port (Driven Port)
//!
//! Source of historical klines used to backfill a kline window before live
//! updates take over.

use async_trait::async_trait;

use crate::domain::market::{CanonicalKline, Interval, Venue};

/// Kline history error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    /// The backend could not be reached.
    #[error("kline history unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// The backend does not know the symbol.
    #[error("no kline history for {symbol}")]
    UnknownSymbol {
        /// The unknown unified symbol.
        symbol: String,
    },
}

/// Port for historical klines.
#[async_trait]
pub trait KlineHistory: Send + Sync {
    /// Fetch up to `limit` klines with `open_time < end_ms`, oldest first.
    async fn fetch(
        &self,
        venue: Venue,
        symbol: &str,
        interval: Interval,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalKline>, HistoryError>;
}
