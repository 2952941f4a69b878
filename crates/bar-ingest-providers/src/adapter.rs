use std::sync::Arc;
use std::time::Duration;

use bar_ingest_core::candle::Candle;
use bar_ingest_core::window::FetchWindow;
use chrono::TimeDelta;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ProviderError, SourceUnavailable};
use crate::provider::{CandleProvider, Interval, SourceRow};

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Rows(Vec<Candle>),
    /// The source had nothing for the request (or nothing inside the window).
    NoData,
}

/// Wraps a [`CandleProvider`] call: bounds it with a timeout, paces request
/// starts, converts timestamps to the canonical timezone and optionally keeps
/// only rows inside a fetch window.
pub struct DataSourceAdapter {
    provider: Arc<dyn CandleProvider>,
    tz: Tz,
    interval: Interval,
    timeout: Duration,
    request_gap: Duration,
    /// Earliest instant the next request may start.
    next_request: Mutex<Instant>,
}

impl DataSourceAdapter {
    pub fn new(provider: Arc<dyn CandleProvider>, tz: Tz, timeout: Duration) -> Self {
        Self {
            provider,
            tz,
            interval: Interval::OneMinute,
            timeout,
            request_gap: Duration::ZERO,
            next_request: Mutex::new(Instant::now()),
        }
    }

    /// Minimum spacing between the starts of two provider requests, shared by
    /// every caller of this adapter.
    pub fn with_request_gap(mut self, gap: Duration) -> Self {
        self.request_gap = gap;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn fetch(
        &self,
        symbol: &str,
        lookback: TimeDelta,
        window: Option<&FetchWindow>,
    ) -> Result<Fetched, SourceUnavailable> {
        let unavailable = |source| SourceUnavailable {
            symbol: symbol.to_string(),
            source,
        };

        if symbol.trim().is_empty() {
            return Err(unavailable(ProviderError::InvalidSymbol(symbol.to_string())));
        }

        self.pace().await;

        let request = self.provider.fetch_rows(symbol, self.interval, lookback);
        let rows = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => return Err(unavailable(e)),
            Err(_) => {
                return Err(unavailable(ProviderError::Timeout {
                    after: self.timeout,
                }));
            }
        };

        let received = rows.len();
        let candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| canonicalize(row, self.tz))
            .filter(|c| window.is_none_or(|w| w.contains(&c.timestamp)))
            .collect();

        debug!(
            "{symbol}: {} returned {received} row(s), {} kept",
            self.provider.name(),
            candles.len()
        );

        if candles.is_empty() {
            Ok(Fetched::NoData)
        } else {
            Ok(Fetched::Rows(candles))
        }
    }

    async fn pace(&self) {
        if self.request_gap.is_zero() {
            return;
        }

        let start_at = {
            let mut next = self.next_request.lock().await;
            let start_at = (*next).max(Instant::now());
            *next = start_at + self.request_gap;
            start_at
        };
        tokio::time::sleep_until(start_at).await;
    }
}

fn canonicalize(row: SourceRow, tz: Tz) -> Candle {
    Candle {
        timestamp: row.timestamp.with_timezone(&tz),
        open: row.open,
        high: row.high,
        low: row.low,
        close: row.close,
        volume: row.volume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bar_ingest_core::window::WindowPolicy;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Asia::Kolkata;
    use rust_decimal_macros::dec;

    enum Behavior {
        Rows(Vec<SourceRow>),
        Fail,
        Hang,
    }

    struct FakeProvider {
        behavior: Behavior,
    }

    #[async_trait]
    impl CandleProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_rows(
            &self,
            _symbol: &str,
            _interval: Interval,
            _lookback: TimeDelta,
        ) -> Result<Vec<SourceRow>, ProviderError> {
            match &self.behavior {
                Behavior::Rows(rows) => Ok(rows.clone()),
                Behavior::Fail => Err(ProviderError::Api {
                    status: 503,
                    message: "unavailable".into(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Row at the given UTC time.
    fn row(hour: u32, min: u32) -> SourceRow {
        SourceRow {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, hour, min, 0).unwrap(),
            open: dec!(100.0),
            high: dec!(101.0),
            low: dec!(99.0),
            close: dec!(100.5),
            volume: 10,
        }
    }

    fn adapter(behavior: Behavior) -> DataSourceAdapter {
        DataSourceAdapter::new(
            Arc::new(FakeProvider { behavior }),
            Kolkata,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn converts_timestamps_to_canonical_zone() {
        let adapter = adapter(Behavior::Rows(vec![row(4, 30)]));
        let fetched = adapter
            .fetch("TCS.NS", TimeDelta::minutes(15), None)
            .await
            .unwrap();

        let Fetched::Rows(candles) = fetched else {
            panic!("expected rows");
        };
        assert_eq!(candles[0].timestamp.timezone(), Kolkata);
        assert_eq!(
            candles[0].timestamp.format("%H:%M").to_string(),
            "10:00"
        );
    }

    #[tokio::test]
    async fn window_keeps_only_rows_inside() {
        // 04:14..04:31 UTC = 09:44..10:01 IST; window [09:45, 10:00) IST
        let adapter = adapter(Behavior::Rows(vec![
            row(4, 14),
            row(4, 15),
            row(4, 29),
            row(4, 30),
            row(4, 31),
        ]));
        let now = Kolkata.with_ymd_and_hms(2025, 1, 15, 10, 7, 0).unwrap();
        let window = WindowPolicy::aligned_minutes(15).compute(&now);

        let fetched = adapter
            .fetch("TCS.NS", TimeDelta::days(1), Some(&window))
            .await
            .unwrap();

        let Fetched::Rows(candles) = fetched else {
            panic!("expected rows");
        };
        let minutes: Vec<String> = candles
            .iter()
            .map(|c| c.timestamp.format("%H:%M").to_string())
            .collect();
        assert_eq!(minutes, vec!["09:45", "09:59"]);
    }

    #[tokio::test]
    async fn empty_result_is_no_data() {
        let adapter = adapter(Behavior::Rows(Vec::new()));
        let fetched = adapter
            .fetch("TCS.NS", TimeDelta::minutes(15), None)
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::NoData);
    }

    #[tokio::test]
    async fn everything_filtered_out_is_no_data() {
        let adapter = adapter(Behavior::Rows(vec![row(3, 0)]));
        let now = Kolkata.with_ymd_and_hms(2025, 1, 15, 10, 7, 0).unwrap();
        let window = WindowPolicy::aligned_minutes(15).compute(&now);

        let fetched = adapter
            .fetch("TCS.NS", TimeDelta::days(1), Some(&window))
            .await
            .unwrap();
        assert_eq!(fetched, Fetched::NoData);
    }

    #[tokio::test]
    async fn provider_error_becomes_source_unavailable() {
        let adapter = adapter(Behavior::Fail);
        let err = adapter
            .fetch("TCS.NS", TimeDelta::minutes(15), None)
            .await
            .unwrap_err();

        assert_eq!(err.symbol, "TCS.NS");
        assert!(matches!(err.source, ProviderError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let adapter = DataSourceAdapter::new(
            Arc::new(FakeProvider {
                behavior: Behavior::Hang,
            }),
            Kolkata,
            Duration::from_millis(50),
        );

        let err = adapter
            .fetch("TCS.NS", TimeDelta::minutes(15), None)
            .await
            .unwrap_err();
        assert!(matches!(err.source, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn blank_symbol_rejected() {
        let adapter = adapter(Behavior::Rows(vec![row(4, 30)]));
        let err = adapter
            .fetch("  ", TimeDelta::minutes(15), None)
            .await
            .unwrap_err();
        assert!(matches!(err.source, ProviderError::InvalidSymbol(_)));
    }

    #[tokio::test]
    async fn request_gap_spaces_consecutive_fetches() {
        let adapter = adapter(Behavior::Rows(vec![row(4, 30)]))
            .with_request_gap(Duration::from_millis(40));

        let started = Instant::now();
        for _ in 0..3 {
            adapter
                .fetch("TCS.NS", TimeDelta::minutes(15), None)
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
