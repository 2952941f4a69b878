use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid symbol: '{0}'")]
    InvalidSymbol(String),

    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },
}

/// The data source could not deliver rows for one instrument. Always
/// recoverable: the next scheduled cycle retries.
#[derive(Debug, Error)]
#[error("source unavailable for {symbol}: {source}")]
pub struct SourceUnavailable {
    pub symbol: String,
    #[source]
    pub source: ProviderError,
}
