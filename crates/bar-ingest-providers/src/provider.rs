use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use crate::error::ProviderError;

/// Bar granularity requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    OneMinute,
}

impl Interval {
    /// Interval code understood by the Yahoo chart API.
    pub fn code(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
        }
    }
}

/// One OHLCV row as delivered by a provider, timestamped in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

/// Trait for fetching intraday OHLCV rows from an external source.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    /// Provider name (for logging/display).
    fn name(&self) -> &str;

    /// Fetch rows for `symbol` covering the `lookback` period that ends now.
    /// Returns an empty vec when the source has nothing for the period.
    async fn fetch_rows(
        &self,
        symbol: &str,
        interval: Interval,
        lookback: TimeDelta,
    ) -> Result<Vec<SourceRow>, ProviderError>;
}
