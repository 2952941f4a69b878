use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bar_ingest_cli::config::{PipelineConfig, WindowConfig};
use bar_ingest_cli::cycle::{InstrumentOutcome, Pipeline};
use bar_ingest_core::candle::Candle;
use bar_ingest_core::schema;
use bar_ingest_core::snapshot::SnapshotFormat;
use bar_ingest_core::store::SeriesStore;
use bar_ingest_providers::yahoo::YahooProvider;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bar-ingest",
    about = "Fetch minute bars for a basket of instruments, store them, and publish a snapshot"
)]
struct Cli {
    /// Root directory for data storage (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file (defaults are used if omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append log lines to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one fetch, ingest and snapshot cycle
    Run {
        /// Symbols to fetch (comma-separated, replaces the configured basket)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,

        /// Fetch the most recently completed bucket of this many minutes
        #[arg(long, conflicts_with = "rolling_minutes")]
        bucket_minutes: Option<u32>,

        /// Fetch the last N minutes ending now
        #[arg(long)]
        rolling_minutes: Option<i64>,

        #[command(flatten)]
        snapshot: SnapshotArgs,
    },

    /// Regenerate the snapshot from stored data without fetching
    Snapshot {
        #[command(flatten)]
        snapshot: SnapshotArgs,
    },

    /// Show what data exists in the store
    Status {
        /// Filter by symbol (shows all if omitted)
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Validate series files and report issues
    Validate {
        /// Symbols to validate (all if omitted, comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,
    },
}

#[derive(Args)]
struct SnapshotArgs {
    /// Most recent rows per instrument
    #[arg(long)]
    depth: Option<usize>,

    /// Snapshot output file
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Snapshot format: markdown, html
    #[arg(long)]
    format: Option<SnapshotFormat>,
}

impl SnapshotArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(depth) = self.depth {
            config.snapshot_depth = depth;
        }
        if let Some(path) = &self.snapshot {
            config.snapshot_path = path.clone();
        }
        if let Some(format) = self.format {
            config.snapshot_format = format;
        }
    }
}

/// File or defaults, then command-line overrides, then validation.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }

    match &cli.command {
        Commands::Run {
            symbols,
            bucket_minutes,
            rolling_minutes,
            snapshot,
        } => {
            if let Some(symbols) = symbols {
                config.symbols = symbols.clone();
            }
            if let Some(minutes) = bucket_minutes {
                config.window = WindowConfig::AlignedBucket { minutes: *minutes };
            }
            if let Some(minutes) = rolling_minutes {
                config.window = WindowConfig::Rolling { minutes: *minutes };
            }
            snapshot.apply(&mut config);
        }
        Commands::Snapshot { snapshot } => snapshot.apply(&mut config),
        Commands::Status { .. } | Commands::Validate { .. } => {}
    }

    config.normalize();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn cmd_run(config: PipelineConfig) -> Result<()> {
    let provider = YahooProvider::new().context("failed to create Yahoo provider")?;
    let pipeline = Pipeline::new(config, Arc::new(provider))?;

    let report = pipeline.run_cycle(chrono::Utc::now()).await;

    for instrument in &report.instruments {
        match &instrument.outcome {
            InstrumentOutcome::Inserted { fetched, inserted } => {
                println!("{}: {inserted} new of {fetched} fetched", instrument.symbol);
            }
            InstrumentOutcome::NoData => println!("{}: no data", instrument.symbol),
            InstrumentOutcome::Failed(e) => println!("{}: FAILED: {e}", instrument.symbol),
        }
    }
    println!(
        "{} succeeded, {} failed, {} new row(s)",
        report.succeeded(),
        report.failed(),
        report.total_inserted()
    );
    if report.snapshot.is_none() {
        println!("Snapshot not written, see log.");
    }

    Ok(())
}

fn cmd_snapshot(config: &PipelineConfig) -> Result<()> {
    let store = open_store(config)?;
    let reporter = config.snapshot_reporter();

    let generated_at = chrono::Utc::now().with_timezone(&config.timezone);
    let summary = reporter
        .write(&store, &config.symbols, &generated_at)
        .context("failed to write snapshot")?;
    println!(
        "Wrote {} section(s) to {}",
        summary.sections_written,
        reporter.path().display()
    );
    Ok(())
}

fn cmd_status(store: &SeriesStore, symbol: Option<&str>) -> Result<()> {
    let symbols = match symbol {
        Some(s) => vec![s.trim().to_uppercase()],
        None => store.list_symbols().context("failed to list symbols")?,
    };

    if symbols.is_empty() {
        println!("No data in store.");
        return Ok(());
    }

    for sym in &symbols {
        let range = store
            .time_range(sym)
            .with_context(|| format!("failed to read series for {sym}"))?;

        match range {
            Some((first, last)) => {
                let rows = store
                    .series_len(sym)
                    .with_context(|| format!("failed to read series for {sym}"))?;
                println!("{sym}: {rows} row(s), {first} to {last}");
            }
            None => println!("{sym}: no data"),
        }
    }

    Ok(())
}

/// Problems found in one series, as printable messages.
fn validate_series(candles: &[Candle]) -> Vec<String> {
    let mut issues = Vec::new();

    if let Some(i) = candles
        .windows(2)
        .position(|pair| pair[1].timestamp <= pair[0].timestamp)
    {
        issues.push(format!(
            "timestamps not strictly ascending at index {}",
            i + 1
        ));
    }

    let negative = candles
        .iter()
        .filter(|c| {
            [c.open, c.high, c.low, c.close]
                .iter()
                .any(|p| p.is_sign_negative())
        })
        .count();
    if negative > 0 {
        issues.push(format!("{negative} row(s) with negative prices"));
    }

    let zero_volume = candles.iter().filter(|c| c.volume == 0).count();
    if zero_volume > 0 {
        issues.push(format!("{zero_volume} row(s) with zero volume"));
    }

    issues
}

fn cmd_validate(store: &SeriesStore, symbols: Option<&[String]>) -> Result<()> {
    let symbols_to_check: Vec<String> = match symbols {
        Some(list) => list.iter().map(|s| s.trim().to_uppercase()).collect(),
        None => store.list_symbols().context("failed to list symbols")?,
    };

    if symbols_to_check.is_empty() {
        println!("No data to validate.");
        return Ok(());
    }

    let mut issues = 0;

    for sym in &symbols_to_check {
        let path = store.file_path(sym);
        if !path.exists() {
            println!("WARN: {sym}: no series file");
            issues += 1;
            continue;
        }

        // Read the file directly so ordering problems are not masked by the store.
        match schema::read_parquet(&path, store.timezone()) {
            Ok(candles) if candles.is_empty() => println!("{sym}: empty"),
            Ok(candles) => {
                for issue in validate_series(&candles) {
                    println!("WARN: {sym}: {issue}");
                    issues += 1;
                }
            }
            Err(e) => {
                println!("ERROR: {sym}: failed to read: {e}");
                issues += 1;
            }
        }
    }

    if issues == 0 {
        println!("All series valid.");
    } else {
        println!("{issues} issue(s) found.");
    }

    Ok(())
}

fn open_store(config: &PipelineConfig) -> Result<SeriesStore> {
    SeriesStore::open(&config.data_dir, config.timezone)
        .with_context(|| format!("failed to open store at {}", config.data_dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = load_config(&cli)?;
    info!(
        "Data dir {}, {} symbol(s), timezone {}",
        config.data_dir.display(),
        config.symbols.len(),
        config.timezone
    );

    match &cli.command {
        Commands::Run { .. } => cmd_run(config).await?,
        Commands::Snapshot { .. } => cmd_snapshot(&config)?,
        Commands::Status { symbol } => {
            let store = open_store(&config)?;
            cmd_status(&store, symbol.as_deref())?;
        }
        Commands::Validate { symbols } => {
            let store = open_store(&config)?;
            cmd_validate(&store, symbols.as_deref())?;
        }
    }

    Ok(())
}
