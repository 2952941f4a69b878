use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use chrono_tz::Tz;
use tracing::debug;

use crate::candle::Candle;
use crate::error::StoreError;
use crate::schema;

const SERIES_EXTENSION: &str = "parquet";

/// Filesystem-backed store of per-symbol 1-minute candle series in Parquet format.
///
/// Directory layout: `{root}/series/{SYMBOL}.parquet`
///
/// Each series is keyed by timestamp. Writes to one symbol are serialized by a
/// per-symbol mutex and land through write-to-temp-then-rename, so readers
/// always see either the previous or the new complete file.
pub struct SeriesStore {
    series_dir: PathBuf,
    tz: Tz,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SeriesStore {
    /// Open (creating if needed) a store rooted at the given directory.
    /// The `series/` subdirectory is used automatically.
    pub fn open(root: impl AsRef<Path>, tz: Tz) -> Result<Self, StoreError> {
        let series_dir = root.as_ref().join("series");
        fs::create_dir_all(&series_dir)?;
        Ok(Self {
            series_dir,
            tz,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Canonical timezone every returned candle is expressed in.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn series_dir(&self) -> &Path {
        &self.series_dir
    }

    /// Path to the Parquet file backing a symbol's series.
    pub fn file_path(&self, symbol: &str) -> PathBuf {
        self.series_dir.join(format!("{symbol}.{SERIES_EXTENSION}"))
    }

    pub fn has_series(&self, symbol: &str) -> bool {
        self.file_path(symbol).exists()
    }

    /// Create an empty series for `symbol` if none exists.
    /// Returns `true` when a new series was created.
    pub fn ensure_series(&self, symbol: &str) -> Result<bool, StoreError> {
        validate_symbol(symbol)?;
        let lock = self.series_lock(symbol)?;
        let _guard = lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned(symbol.to_string()))?;

        if self.has_series(symbol) {
            return Ok(false);
        }
        self.replace_series(symbol, &[])?;
        debug!("{symbol}: created empty series");
        Ok(true)
    }

    /// Insert candles whose timestamp is not yet present in the series.
    ///
    /// Existing timestamps are never overwritten, even when the incoming values
    /// differ; within `candles`, the first occurrence of a timestamp wins.
    /// Returns how many candles were actually inserted. Creates the series if
    /// it does not exist yet.
    pub fn upsert(&self, symbol: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        validate_symbol(symbol)?;
        let lock = self.series_lock(symbol)?;
        let _guard = lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned(symbol.to_string()))?;

        let existed = self.has_series(symbol);
        let mut series: BTreeMap<i64, Candle> = self
            .load(symbol)?
            .into_iter()
            .map(|c| (c.key(), c))
            .collect();

        let mut inserted = 0;
        for candle in candles {
            if let Entry::Vacant(slot) = series.entry(candle.key()) {
                slot.insert(Candle {
                    timestamp: candle.timestamp.with_timezone(&self.tz),
                    ..candle.clone()
                });
                inserted += 1;
            }
        }

        if inserted > 0 || !existed {
            let merged: Vec<Candle> = series.into_values().collect();
            self.replace_series(symbol, &merged)?;
        }

        debug!(
            "{symbol}: upsert of {} candle(s) inserted {inserted}",
            candles.len()
        );
        Ok(inserted)
    }

    /// All candles of a series in ascending timestamp order.
    /// An absent series reads as empty.
    pub fn read_all(&self, symbol: &str) -> Result<Vec<Candle>, StoreError> {
        validate_symbol(symbol)?;
        let mut candles = self.load(symbol)?;
        candles.sort_by_key(Candle::key);
        Ok(candles)
    }

    /// The last `k` candles in descending timestamp order.
    /// An absent or empty series reads as empty.
    pub fn read_recent(&self, symbol: &str, k: usize) -> Result<Vec<Candle>, StoreError> {
        let mut candles = self.read_all(symbol)?;
        candles.reverse();
        candles.truncate(k);
        Ok(candles)
    }

    pub fn series_len(&self, symbol: &str) -> Result<usize, StoreError> {
        Ok(self.read_all(symbol)?.len())
    }

    /// First and last timestamp of a series, or `None` when it is empty or absent.
    pub fn time_range(
        &self,
        symbol: &str,
    ) -> Result<Option<(DateTime<Tz>, DateTime<Tz>)>, StoreError> {
        let candles = self.read_all(symbol)?;
        Ok(candles
            .first()
            .map(|c| c.timestamp.clone())
            .zip(candles.last().map(|c| c.timestamp.clone())))
    }

    /// List all symbols that have a series in the store, sorted.
    pub fn list_symbols(&self) -> Result<Vec<String>, StoreError> {
        if !self.series_dir.exists() {
            return Ok(Vec::new());
        }

        let mut symbols = Vec::new();
        for entry in fs::read_dir(&self.series_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if let Some(symbol) = name
                .strip_suffix(SERIES_EXTENSION)
                .and_then(|s| s.strip_suffix('.'))
            {
                symbols.push(symbol.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    fn load(&self, symbol: &str) -> Result<Vec<Candle>, StoreError> {
        let path = self.file_path(symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }
        schema::read_parquet(&path, self.tz)
    }

    fn series_lock(&self, symbol: &str) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StoreError::LockPoisoned(symbol.to_string()))?;
        Ok(Arc::clone(locks.entry(symbol.to_string()).or_default()))
    }

    /// Atomically replace a series file: write to `.tmp`, then rename into place.
    fn replace_series(&self, symbol: &str, candles: &[Candle]) -> Result<(), StoreError> {
        let path = self.file_path(symbol);
        let tmp_path = path.with_extension("parquet.tmp");

        if let Err(e) = schema::write_parquet(&tmp_path, candles, self.tz) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        sync_dir(&self.series_dir)
    }
}

/// Symbols become file names, so they must not be able to escape the series directory.
fn validate_symbol(symbol: &str) -> Result<(), StoreError> {
    let invalid = symbol.trim().is_empty()
        || symbol == "."
        || symbol == ".."
        || symbol.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidSymbol(symbol.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}
