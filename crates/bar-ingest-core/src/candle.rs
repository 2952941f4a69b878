use chrono::DateTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;

/// A single 1-minute OHLCV candle, timestamped in the canonical timezone.
///
/// The timestamp is the natural key of a candle within its series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candle {
    pub timestamp: DateTime<Tz>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

impl Candle {
    /// Key used for deduplication and ordering: microseconds since the Unix epoch.
    pub fn key(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }
}
