use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid symbol: '{0}'")]
    InvalidSymbol(String),

    #[error("Series lock for {0} was poisoned by a panicking writer")]
    LockPoisoned(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Failure to render one instrument's snapshot section.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read {symbol}: {source}")]
    Read {
        symbol: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to format {symbol}")]
    Format {
        symbol: String,
        #[source]
        source: std::fmt::Error,
    },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to format snapshot header")]
    Format(#[from] std::fmt::Error),
}
