use std::path::PathBuf;
use std::sync::Arc;

use bar_ingest_core::candle::Candle;
use bar_ingest_core::error::{SnapshotError, StoreError};
use bar_ingest_core::snapshot::{SnapshotReporter, SnapshotSummary};
use bar_ingest_core::store::SeriesStore;
use bar_ingest_core::window::{FetchWindow, WindowPolicy};
use bar_ingest_providers::adapter::{DataSourceAdapter, Fetched};
use bar_ingest_providers::error::SourceUnavailable;
use bar_ingest_providers::provider::CandleProvider;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, PipelineConfig};

/// Failure for a single instrument. Never crosses the instrument boundary.
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error(transparent)]
    Source(#[from] SourceUnavailable),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize store at {path}: {source}")]
    Initialization {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug)]
pub enum InstrumentOutcome {
    /// Rows came back; `inserted` counts the ones that were new.
    Inserted { fetched: usize, inserted: usize },
    NoData,
    Failed(InstrumentError),
}

impl InstrumentOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, InstrumentOutcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct InstrumentReport {
    pub symbol: String,
    pub outcome: InstrumentOutcome,
}

#[derive(Debug)]
pub struct CycleReport {
    pub window: FetchWindow,
    /// One entry per configured symbol, in basket order.
    pub instruments: Vec<InstrumentReport>,
    /// `None` when the snapshot could not be written.
    pub snapshot: Option<SnapshotSummary>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.instruments
            .iter()
            .filter(|r| !r.outcome.is_failure())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.instruments
            .iter()
            .filter(|r| r.outcome.is_failure())
            .count()
    }

    pub fn total_inserted(&self) -> usize {
        self.instruments
            .iter()
            .map(|r| match r.outcome {
                InstrumentOutcome::Inserted { inserted, .. } => inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, symbol: &str) -> Option<&InstrumentOutcome> {
        self.instruments
            .iter()
            .find(|r| r.symbol == symbol)
            .map(|r| &r.outcome)
    }
}

/// Drives fetch → upsert for every instrument, then refreshes the snapshot.
///
/// Owns the single store handle for its lifetime.
pub struct Pipeline {
    config: PipelineConfig,
    policy: WindowPolicy,
    store: Arc<SeriesStore>,
    adapter: DataSourceAdapter,
    reporter: SnapshotReporter,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, provider: Arc<dyn CandleProvider>) -> Result<Self, CycleError> {
        config.validate()?;

        let store = SeriesStore::open(&config.data_dir, config.timezone).map_err(|source| {
            CycleError::Initialization {
                path: config.data_dir.clone(),
                source,
            }
        })?;

        let adapter = DataSourceAdapter::new(provider, config.timezone, config.fetch_timeout())
            .with_request_gap(config.request_gap());
        let reporter = config.snapshot_reporter();

        Ok(Self {
            policy: config.window_policy(),
            config,
            store: Arc::new(store),
            adapter,
            reporter,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    /// Run one complete cycle as of `now`. Per-instrument failures are
    /// recorded in the report and never stop the other instruments or the
    /// snapshot.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let local_now = now.with_timezone(&self.config.timezone);
        let window = self.policy.compute(&local_now);
        info!(
            "Starting cycle for {} symbol(s) via {}, window {} to {}",
            self.config.symbols.len(),
            self.adapter.provider_name(),
            window.start,
            window.end
        );

        let ensured = self.ensure_all().await;

        let mut instruments: Vec<(usize, InstrumentReport)> = stream::iter(ensured.into_iter().enumerate())
            .map(|(index, (symbol, ready))| {
                let window = &window;
                async move {
                    let outcome = match ready {
                        Ok(()) => self.ingest_instrument(&symbol, window).await,
                        Err(e) => {
                            warn!("{symbol}: series unavailable: {e}");
                            InstrumentOutcome::Failed(e)
                        }
                    };
                    (index, InstrumentReport { symbol, outcome })
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        instruments.sort_by_key(|(index, _)| *index);
        let instruments = instruments.into_iter().map(|(_, report)| report).collect();

        // Every ingestion future has completed; the store now reflects the cycle.
        let snapshot = match self.write_snapshot(now).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("Snapshot not written: {e}");
                None
            }
        };

        let report = CycleReport {
            window,
            instruments,
            snapshot,
        };
        info!(
            "Cycle complete: {} succeeded, {} failed, {} new row(s)",
            report.succeeded(),
            report.failed(),
            report.total_inserted()
        );
        report
    }

    /// Regenerate the snapshot from the store as of `now`.
    pub async fn write_snapshot(&self, now: DateTime<Utc>) -> Result<SnapshotSummary, SnapshotError> {
        let store = Arc::clone(&self.store);
        let reporter = self.reporter.clone();
        let symbols = self.config.symbols.clone();
        let generated_at: DateTime<Tz> = now.with_timezone(&self.config.timezone);

        let summary = tokio::task::spawn_blocking(move || {
            reporter.write(&store, &symbols, &generated_at)
        })
        .await
        .map_err(|e| SnapshotError::Write {
            path: self.reporter.path().to_path_buf(),
            source: std::io::Error::other(e),
        })??;

        info!(
            "Snapshot written to {}: {} section(s), {} empty, {} failed",
            self.reporter.path().display(),
            summary.sections_written,
            summary.skipped_empty,
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Make sure every configured series exists before fetching.
    async fn ensure_all(&self) -> Vec<(String, Result<(), InstrumentError>)> {
        let store = Arc::clone(&self.store);
        let symbols = self.config.symbols.clone();

        let ensured = tokio::task::spawn_blocking(move || {
            symbols
                .into_iter()
                .map(|symbol| {
                    let result = store
                        .ensure_series(&symbol)
                        .map(|_| ())
                        .map_err(InstrumentError::from);
                    (symbol, result)
                })
                .collect::<Vec<_>>()
        })
        .await;

        match ensured {
            Ok(ensured) => ensured,
            Err(e) => self
                .config
                .symbols
                .iter()
                .map(|symbol| (symbol.clone(), Err(InstrumentError::Task(e.to_string()))))
                .collect(),
        }
    }

    async fn ingest_instrument(&self, symbol: &str, window: &FetchWindow) -> InstrumentOutcome {
        let filter = self.policy.filters_rows().then_some(window);
        let fetched = self
            .adapter
            .fetch(symbol, self.config.fetch_lookback(), filter)
            .await;

        match fetched {
            Ok(Fetched::Rows(candles)) => {
                let fetched = candles.len();
                match self.upsert(symbol, candles).await {
                    Ok(inserted) => {
                        info!("{symbol}: fetched {fetched} row(s), inserted {inserted}");
                        InstrumentOutcome::Inserted { fetched, inserted }
                    }
                    Err(e) => {
                        warn!("{symbol}: upsert failed: {e}");
                        InstrumentOutcome::Failed(e)
                    }
                }
            }
            Ok(Fetched::NoData) => {
                warn!("{symbol}: no data returned");
                InstrumentOutcome::NoData
            }
            Err(e) => {
                warn!("{e}");
                InstrumentOutcome::Failed(e.into())
            }
        }
    }

    async fn upsert(&self, symbol: &str, candles: Vec<Candle>) -> Result<usize, InstrumentError> {
        let store = Arc::clone(&self.store);
        let symbol = symbol.to_string();
        let inserted = tokio::task::spawn_blocking(move || store.upsert(&symbol, &candles))
            .await
            .map_err(|e| InstrumentError::Task(e.to_string()))??;
        Ok(inserted)
    }
}
