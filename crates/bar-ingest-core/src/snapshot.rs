use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candle::Candle;
use crate::error::{RenderError, SnapshotError};
use crate::store::SeriesStore;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// Layout of each instrument section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// GitHub pipe table with every OHLCV column.
    #[default]
    Markdown,
    /// HTML table with timestamp, close and volume.
    Html,
}

impl FromStr for SnapshotFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(SnapshotFormat::Markdown),
            "html" => Ok(SnapshotFormat::Html),
            other => Err(format!("unknown snapshot format: {other}. Expected: markdown, html")),
        }
    }
}

/// What a snapshot write produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub sections_written: usize,
    pub skipped_empty: usize,
    /// Symbols whose section could not be rendered.
    pub failed: Vec<String>,
}

/// Renders the most recent candles of each instrument into a text document
/// that is replaced in full on every write.
#[derive(Debug, Clone)]
pub struct SnapshotReporter {
    path: PathBuf,
    title: String,
    depth: usize,
    format: SnapshotFormat,
}

impl SnapshotReporter {
    pub fn new(
        path: impl Into<PathBuf>,
        title: impl Into<String>,
        depth: usize,
        format: SnapshotFormat,
    ) -> Self {
        Self {
            path: path.into(),
            title: title.into(),
            depth,
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the whole document. Sections that fail are logged and left out.
    pub fn render(
        &self,
        store: &SeriesStore,
        symbols: &[String],
        generated_at: &DateTime<Tz>,
    ) -> Result<(String, SnapshotSummary), SnapshotError> {
        let mut doc = String::new();
        writeln!(doc, "# 📈 {}\n", self.title)?;
        writeln!(
            doc,
            "Last updated: {}\n",
            generated_at.format("%Y-%m-%d %H:%M:%S %Z")
        )?;

        let mut summary = SnapshotSummary::default();
        for symbol in symbols {
            match self.render_section(store, symbol) {
                Ok(Some(section)) => {
                    doc.push_str(&section);
                    summary.sections_written += 1;
                }
                Ok(None) => {
                    debug!("{symbol}: no rows, section skipped");
                    summary.skipped_empty += 1;
                }
                Err(e) => {
                    warn!("{symbol}: snapshot section omitted: {e}");
                    summary.failed.push(symbol.clone());
                }
            }
        }

        Ok((doc, summary))
    }

    /// Render and atomically replace the snapshot file.
    pub fn write(
        &self,
        store: &SeriesStore,
        symbols: &[String],
        generated_at: &DateTime<Tz>,
    ) -> Result<SnapshotSummary, SnapshotError> {
        let (doc, summary) = self.render(store, symbols, generated_at)?;
        replace_file(&self.path, &doc).map_err(|source| SnapshotError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(summary)
    }

    /// `Ok(None)` when the instrument has no rows.
    fn render_section(
        &self,
        store: &SeriesStore,
        symbol: &str,
    ) -> Result<Option<String>, RenderError> {
        let candles = store
            .read_recent(symbol, self.depth)
            .map_err(|source| RenderError::Read {
                symbol: symbol.to_string(),
                source,
            })?;
        if candles.is_empty() {
            return Ok(None);
        }

        let mut section = String::new();
        let rendered = match self.format {
            SnapshotFormat::Markdown => markdown_section(&mut section, symbol, &candles),
            SnapshotFormat::Html => html_section(&mut section, symbol, &candles),
        };
        rendered.map_err(|source| RenderError::Format {
            symbol: symbol.to_string(),
            source,
        })?;
        Ok(Some(section))
    }
}

fn markdown_section(out: &mut String, symbol: &str, candles: &[Candle]) -> std::fmt::Result {
    writeln!(out, "## {symbol}\n")?;
    writeln!(out, "| datetime | open | high | low | close | volume |")?;
    writeln!(out, "|---|---|---|---|---|---|")?;
    for c in candles {
        writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} |",
            c.timestamp.format(TIMESTAMP_FORMAT),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        )?;
    }
    writeln!(out)
}

fn html_section(out: &mut String, symbol: &str, candles: &[Candle]) -> std::fmt::Result {
    writeln!(out, "## {symbol}\n")?;
    writeln!(out, "<table>")?;
    writeln!(out, "  <tr><th>Datetime</th><th>Close</th><th>Volume</th></tr>")?;
    for c in candles {
        writeln!(
            out,
            "  <tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            c.timestamp.format(TIMESTAMP_FORMAT),
            c.close,
            c.volume
        )?;
    }
    writeln!(out, "</table>\n")
}

/// Write to `{path}.tmp`, then rename over `path`.
fn replace_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;
    use rust_decimal_macros::dec;

    fn candle_at(min: u32, close: rust_decimal::Decimal) -> Candle {
        Candle {
            timestamp: Kolkata.with_ymd_and_hms(2025, 1, 15, 10, min, 0).unwrap(),
            open: dec!(1250.00),
            high: dec!(1255.00),
            low: dec!(1248.00),
            close,
            volume: 4200,
        }
    }

    fn generated_at() -> DateTime<Tz> {
        Kolkata.with_ymd_and_hms(2025, 1, 15, 10, 15, 3).unwrap()
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn seeded_store(dir: &Path) -> SeriesStore {
        let store = SeriesStore::open(dir, Kolkata).unwrap();
        store
            .upsert(
                "TCS.NS",
                &[
                    candle_at(0, dec!(4100.00)),
                    candle_at(1, dec!(4101.50)),
                    candle_at(2, dec!(4102.25)),
                ],
            )
            .unwrap();
        store
            .upsert("INFY.NS", &[candle_at(0, dec!(1890.10))])
            .unwrap();
        store.ensure_series("WIPRO.NS").unwrap();
        store
    }

    #[test]
    fn header_carries_generation_time_in_canonical_zone() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let reporter = SnapshotReporter::new(
            dir.path().join("README.md"),
            "NIFTY50 Top 20 Data Snapshot",
            2,
            SnapshotFormat::Markdown,
        );

        let (doc, _) = reporter.render(&store, &[], &generated_at()).unwrap();
        assert!(doc.starts_with("# 📈 NIFTY50 Top 20 Data Snapshot\n\n"));
        assert!(doc.contains("Last updated: 2025-01-15 10:15:03 IST"));
    }

    #[test]
    fn markdown_lists_most_recent_rows_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let reporter =
            SnapshotReporter::new(dir.path().join("README.md"), "t", 2, SnapshotFormat::Markdown);

        let (doc, summary) = reporter
            .render(&store, &symbols(&["TCS.NS"]), &generated_at())
            .unwrap();

        assert_eq!(summary.sections_written, 1);
        assert!(doc.contains("## TCS.NS"));
        let newest = doc.find("2025-01-15 10:02:00+05:30").unwrap();
        let older = doc.find("2025-01-15 10:01:00+05:30").unwrap();
        assert!(newest < older);
        assert!(!doc.contains("10:00:00+05:30"));
        assert!(doc.contains("| 4102.25 | 4200 |"));
    }

    #[test]
    fn empty_series_produce_no_section() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let reporter =
            SnapshotReporter::new(dir.path().join("README.md"), "t", 2, SnapshotFormat::Markdown);

        let (doc, summary) = reporter
            .render(
                &store,
                &symbols(&["WIPRO.NS", "ITC.NS", "INFY.NS"]),
                &generated_at(),
            )
            .unwrap();

        assert!(!doc.contains("WIPRO.NS"));
        assert!(!doc.contains("ITC.NS"));
        assert!(doc.contains("## INFY.NS"));
        assert_eq!(summary.sections_written, 1);
        assert_eq!(summary.skipped_empty, 2);
    }

    #[test]
    fn html_section_has_close_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let reporter =
            SnapshotReporter::new(dir.path().join("README.md"), "t", 2, SnapshotFormat::Html);

        let (doc, _) = reporter
            .render(&store, &symbols(&["INFY.NS"]), &generated_at())
            .unwrap();

        assert!(doc.contains("<tr><th>Datetime</th><th>Close</th><th>Volume</th></tr>"));
        assert!(doc.contains(
            "<tr><td>2025-01-15 10:00:00+05:30</td><td>1890.10</td><td>4200</td></tr>"
        ));
    }

    #[test]
    fn unreadable_series_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        fs::write(store.file_path("SBIN.NS"), b"not a parquet file").unwrap();
        let reporter =
            SnapshotReporter::new(dir.path().join("README.md"), "t", 2, SnapshotFormat::Markdown);

        let summary = reporter
            .write(
                &store,
                &symbols(&["SBIN.NS", "TCS.NS", "INFY.NS"]),
                &generated_at(),
            )
            .unwrap();

        assert_eq!(summary.failed, vec!["SBIN.NS".to_string()]);
        assert_eq!(summary.sections_written, 2);
        let doc = fs::read_to_string(reporter.path()).unwrap();
        assert!(!doc.contains("SBIN.NS"));
        assert!(doc.contains("## TCS.NS"));
        assert!(doc.contains("## INFY.NS"));
    }

    #[test]
    fn write_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let path = dir.path().join("out/README.md");
        let reporter = SnapshotReporter::new(&path, "t", 2, SnapshotFormat::Markdown);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "stale contents").unwrap();
        reporter
            .write(&store, &symbols(&["TCS.NS"]), &generated_at())
            .unwrap();

        let doc = fs::read_to_string(&path).unwrap();
        assert!(!doc.contains("stale contents"));
        assert!(doc.contains("## TCS.NS"));
        assert!(!dir.path().join("out/README.md.tmp").exists());
    }

    #[test]
    fn format_parses_from_str() {
        assert_eq!(
            "markdown".parse::<SnapshotFormat>(),
            Ok(SnapshotFormat::Markdown)
        );
        assert_eq!("HTML".parse::<SnapshotFormat>(), Ok(SnapshotFormat::Html));
        assert!("pdf".parse::<SnapshotFormat>().is_err());
    }
}
