use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{CandleProvider, Interval, SourceRow};

const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance market data provider.
/// No authentication required. 1-minute bars reach back about 7 days.
pub struct YahooProvider {
    client: Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_base_url(YAHOO_CHART_URL.to_string())
    }

    /// Create with a custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self, ProviderError> {
        let client = Client::builder().user_agent("Mozilla/5.0").build()?;
        Ok(Self { client, base_url })
    }
}

#[derive(Debug, Deserialize)]
struct YahooResponse {
    chart: YahooChart,
}

#[derive(Debug, Deserialize)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct YahooResult {
    timestamp: Option<Vec<i64>>,
    indicators: YahooIndicators,
}

#[derive(Debug, Deserialize)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

/// Yahoo sends `"quote": [{}]` for a period without bars.
#[derive(Debug, Deserialize)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

fn f64_to_price(val: f64, field: &str, ts: i64) -> Result<Decimal, ProviderError> {
    let price = Decimal::try_from(val)
        .map_err(|e| ProviderError::Parse(format!("invalid {field} at {ts}: {e}")))?;
    if price.is_sign_negative() {
        return Err(ProviderError::Parse(format!(
            "negative {field} at {ts}: {price}"
        )));
    }
    Ok(price)
}

/// Convert a chart result into rows.
///
/// Minutes where every price is null are trading gaps and are skipped. A row
/// with only some prices present, a negative value, or columns of unequal
/// length means the response is malformed.
fn parse_yahoo_result(result: &YahooResult) -> Result<Vec<SourceRow>, ProviderError> {
    let Some(timestamps) = result.timestamp.as_ref() else {
        // Yahoo omits the timestamp array entirely when the period has no bars.
        return Ok(Vec::new());
    };

    let Some(quote) = result.indicators.quote.first() else {
        return Ok(Vec::new());
    };

    let n = timestamps.len();
    let lengths = [
        quote.open.len(),
        quote.high.len(),
        quote.low.len(),
        quote.close.len(),
        quote.volume.len(),
    ];
    if lengths.iter().any(|&len| len != n) {
        return Err(ProviderError::Parse(format!(
            "column lengths {lengths:?} do not match {n} timestamps"
        )));
    }

    let mut rows = Vec::with_capacity(n);
    for (i, &ts) in timestamps.iter().enumerate() {
        let prices = [quote.open[i], quote.high[i], quote.low[i], quote.close[i]];
        let [Some(open), Some(high), Some(low), Some(close)] = prices else {
            if prices.iter().all(Option::is_none) {
                continue;
            }
            return Err(ProviderError::Parse(format!(
                "incomplete prices at {ts}: {prices:?}"
            )));
        };

        let volume = quote.volume[i].unwrap_or(0);
        if volume < 0 {
            return Err(ProviderError::Parse(format!(
                "negative volume at {ts}: {volume}"
            )));
        }

        let timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| ProviderError::Parse(format!("invalid unix timestamp: {ts}")))?;

        rows.push(SourceRow {
            timestamp,
            open: f64_to_price(open, "open", ts)?,
            high: f64_to_price(high, "high", ts)?,
            low: f64_to_price(low, "low", ts)?,
            close: f64_to_price(close, "close", ts)?,
            volume,
        });
    }

    Ok(rows)
}

#[async_trait]
impl CandleProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo"
    }

    async fn fetch_rows(
        &self,
        symbol: &str,
        interval: Interval,
        lookback: TimeDelta,
    ) -> Result<Vec<SourceRow>, ProviderError> {
        let end = Utc::now();
        let start = end - lookback;

        debug!(
            "{symbol}: requesting {} bars from {start} to {end}",
            interval.code()
        );

        let response = self
            .client
            .get(format!("{}/{}", self.base_url, symbol))
            .query(&[
                ("period1", start.timestamp().to_string()),
                ("period2", end.timestamp().to_string()),
                ("interval", interval.code().to_string()),
                ("includePrePost", "false".to_string()),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: body,
            });
        }

        let body: YahooResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("failed to parse response: {e}")))?;

        if let Some(error) = body.chart.error {
            return Err(ProviderError::Api {
                status: 0,
                message: format!("{}: {}", error.code, error.description),
            });
        }

        let results = body
            .chart
            .result
            .ok_or_else(|| ProviderError::Parse("no results in response".into()))?;

        let Some(first) = results.first() else {
            return Ok(Vec::new());
        };

        let mut rows = parse_yahoo_result(first)?;
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parse(json: &str) -> Result<Vec<SourceRow>, ProviderError> {
        let response: YahooResponse = serde_json::from_str(json).unwrap();
        let results = response.chart.result.unwrap();
        parse_yahoo_result(&results[0])
    }

    #[test]
    fn parse_minute_response() {
        // 2025-01-15 04:30 and 04:31 UTC (10:00 and 10:01 IST)
        let rows = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400, 1736915460],
                    "indicators": {
                        "quote": [{
                            "open": [1250.5, 1251.0],
                            "high": [1251.5, 1252.0],
                            "low": [1249.0, 1250.5],
                            "close": [1251.0, 1251.75],
                            "volume": [1000, 2000]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].timestamp,
            Utc.with_ymd_and_hms(2025, 1, 15, 4, 30, 0).unwrap()
        );
        assert_eq!(rows[0].open, dec!(1250.5));
        assert_eq!(rows[1].close, dec!(1251.75));
        assert_eq!(rows[1].volume, 2000);
    }

    #[test]
    fn gap_minutes_are_skipped() {
        let rows = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400, 1736915460, 1736915520],
                    "indicators": {
                        "quote": [{
                            "open": [150.12, null, 151.00],
                            "high": [151.50, null, 152.00],
                            "low": [149.00, null, 150.50],
                            "close": [150.99, null, 151.75],
                            "volume": [1000, null, 2000]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn partially_missing_prices_are_malformed() {
        let result = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400],
                    "indicators": {
                        "quote": [{
                            "open": [150.12],
                            "high": [null],
                            "low": [149.00],
                            "close": [150.99],
                            "volume": [1000]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        );

        assert!(matches!(result, Err(ProviderError::Parse(_))));
    }

    #[test]
    fn mismatched_columns_are_malformed() {
        let result = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400, 1736915460],
                    "indicators": {
                        "quote": [{
                            "open": [150.12],
                            "high": [151.0],
                            "low": [149.00],
                            "close": [150.99],
                            "volume": [1000]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        );

        assert!(matches!(result, Err(ProviderError::Parse(_))));
    }

    #[test]
    fn negative_price_is_malformed() {
        let result = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400],
                    "indicators": {
                        "quote": [{
                            "open": [-1.0],
                            "high": [151.0],
                            "low": [149.00],
                            "close": [150.99],
                            "volume": [1000]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        );

        assert!(matches!(result, Err(ProviderError::Parse(_))));
    }

    #[test]
    fn missing_volume_is_zero() {
        let rows = parse(
            r#"{
            "chart": {
                "result": [{
                    "timestamp": [1736915400],
                    "indicators": {
                        "quote": [{
                            "open": [150.0],
                            "high": [151.0],
                            "low": [149.0],
                            "close": [150.5],
                            "volume": [null]
                        }]
                    }
                }],
                "error": null
            }
        }"#,
        )
        .unwrap();

        assert_eq!(rows[0].volume, 0);
    }

    #[test]
    fn no_timestamps_means_no_rows() {
        let rows = parse(
            r#"{
            "chart": {
                "result": [{
                    "meta": { "symbol": "TCS.NS" },
                    "indicators": { "quote": [{}] }
                }],
                "error": null
            }
        }"#,
        )
        .unwrap();

        assert!(rows.is_empty());
    }

    #[test]
    fn parse_yahoo_error_response() {
        let json = r#"{
            "chart": {
                "result": null,
                "error": {
                    "code": "Not Found",
                    "description": "No data found, symbol may be delisted"
                }
            }
        }"#;

        let response: YahooResponse = serde_json::from_str(json).unwrap();
        assert!(response.chart.error.is_some());
        assert_eq!(response.chart.error.as_ref().unwrap().code, "Not Found");
    }

    #[test]
    fn interval_code() {
        assert_eq!(Interval::OneMinute.code(), "1m");
    }
}
