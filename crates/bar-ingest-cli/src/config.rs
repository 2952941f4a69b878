use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bar_ingest_core::snapshot::{SnapshotFormat, SnapshotReporter};
use bar_ingest_core::window::WindowPolicy;
use chrono::TimeDelta;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top 20 NIFTY50 constituents, Yahoo Finance tickers.
pub const DEFAULT_SYMBOLS: [&str; 20] = [
    "RELIANCE.NS",
    "HDFCBANK.NS",
    "ICICIBANK.NS",
    "INFY.NS",
    "TCS.NS",
    "ITC.NS",
    "HINDUNILVR.NS",
    "SBIN.NS",
    "BHARTIARTL.NS",
    "KOTAKBANK.NS",
    "LT.NS",
    "AXISBANK.NS",
    "BAJFINANCE.NS",
    "ASIANPAINT.NS",
    "MARUTI.NS",
    "SUNPHARMA.NS",
    "WIPRO.NS",
    "POWERGRID.NS",
    "NTPC.NS",
    "ONGC.NS",
];

const MINUTES_PER_DAY: u32 = 24 * 60;

/// 1-minute bars reach back about a week at the source.
const MAX_LOOKBACK_MINUTES: i64 = 7 * MINUTES_PER_DAY as i64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Window policy as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WindowConfig {
    /// The last `minutes` minutes, ending now.
    Rolling { minutes: i64 },
    /// The most recently completed `minutes`-minute bucket.
    AlignedBucket { minutes: u32 },
}

impl WindowConfig {
    pub fn policy(&self) -> WindowPolicy {
        match *self {
            WindowConfig::Rolling { minutes } => WindowPolicy::rolling_minutes(minutes),
            WindowConfig::AlignedBucket { minutes } => WindowPolicy::aligned_minutes(minutes),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig::AlignedBucket { minutes: 15 }
    }
}

/// Pipeline configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// symbols = ["RELIANCE.NS", "TCS.NS"]
/// snapshot_depth = 3
///
/// [window]
/// policy = "aligned_bucket"
/// minutes = 15
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Instrument basket, provider tickers.
    pub symbols: Vec<String>,
    /// Canonical timezone for stored and reported timestamps.
    pub timezone: Tz,
    pub window: WindowConfig,
    /// How far back the provider is asked to look when the window policy
    /// filters rows after fetching.
    pub source_lookback_minutes: i64,
    /// Rows per instrument in the snapshot.
    pub snapshot_depth: usize,
    pub snapshot_path: PathBuf,
    pub snapshot_title: String,
    pub snapshot_format: SnapshotFormat,
    /// Root of the series store.
    pub data_dir: PathBuf,
    /// Instruments fetched in parallel.
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    /// Minimum spacing between provider request starts.
    pub request_gap_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            timezone: chrono_tz::Asia::Kolkata,
            window: WindowConfig::default(),
            source_lookback_minutes: i64::from(MINUTES_PER_DAY),
            snapshot_depth: 2,
            snapshot_path: PathBuf::from("README.md"),
            snapshot_title: "NIFTY50 Top 20 Data Snapshot".to_string(),
            snapshot_format: SnapshotFormat::Markdown,
            data_dir: PathBuf::from("."),
            concurrency: 4,
            fetch_timeout_secs: 30,
            request_gap_ms: 250,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Trim and uppercase symbols.
    pub fn normalize(&mut self) {
        for symbol in &mut self.symbols {
            *symbol = symbol.trim().to_uppercase();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbol basket is empty".into()));
        }

        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return Err(ConfigError::Invalid("blank symbol in basket".into()));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate symbol: {symbol}")));
            }
        }

        match self.window {
            WindowConfig::Rolling { minutes } if !(1..=MAX_LOOKBACK_MINUTES).contains(&minutes) => {
                return Err(ConfigError::Invalid(format!(
                    "rolling window must be 1 to {MAX_LOOKBACK_MINUTES} minute(s), got {minutes}"
                )));
            }
            WindowConfig::AlignedBucket { minutes }
                if minutes == 0 || MINUTES_PER_DAY % minutes != 0 =>
            {
                return Err(ConfigError::Invalid(format!(
                    "bucket of {minutes} minute(s) does not divide a day"
                )));
            }
            _ => {}
        }

        if !(1..=MAX_LOOKBACK_MINUTES).contains(&self.source_lookback_minutes) {
            return Err(ConfigError::Invalid(format!(
                "source_lookback_minutes must be 1 to {MAX_LOOKBACK_MINUTES}, got {}",
                self.source_lookback_minutes
            )));
        }
        if self.snapshot_depth == 0 {
            return Err(ConfigError::Invalid("snapshot_depth must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn window_policy(&self) -> WindowPolicy {
        self.window.policy()
    }

    /// Lookback passed to the provider. A rolling window asks for exactly its
    /// span; an aligned bucket asks for the source lookback, but never less
    /// than two buckets so the just-closed bucket is always covered.
    pub fn fetch_lookback(&self) -> TimeDelta {
        let policy = self.window_policy();
        match policy {
            WindowPolicy::Rolling { lookback } => lookback,
            WindowPolicy::AlignedBucket { .. } => {
                TimeDelta::minutes(self.source_lookback_minutes).max(policy.span() * 2)
            }
        }
    }

    pub fn snapshot_reporter(&self) -> SnapshotReporter {
        SnapshotReporter::new(
            self.snapshot_path.clone(),
            self.snapshot_title.clone(),
            self.snapshot_depth,
            self.snapshot_format,
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_gap(&self) -> Duration {
        Duration::from_millis(self.request_gap_ms)
    }
}
