//! Parquet series store.
//!
//! Layout: `{cache_root}/{KEY}.parquet` plus `{cache_root}/_version.json`.
//!
//! - One record per instrument: columns `date, open, high, low, close, volume`,
//!   dates strictly increasing
//! - Atomic writes (write to .tmp, rename into place), serialized per instrument
//! - Corrupt records are quarantined (`{KEY}.parquet.quarantined`) and read as absent
//! - A global version marker discards every record when the schema or
//!   source changes
//!
//! Storage failures never reach the caller: reads degrade to "absent" and
//! writes to a logged no-op. The provider can always rebuild the cache.

use crate::config::CACHE_SCHEMA_VERSION;
use crate::domain::{Bar, BarSeries};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

const MARKER_FILE: &str = "_version.json";
const RECORD_EXT: &str = "parquet";
const COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Internal storage failures. Logged, then downgraded at the public boundary.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("corrupt cache record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },
}

/// Contents of `_version.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionMarker {
    version: u32,
    written_at: chrono::NaiveDateTime,
}

/// Cache status for a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbol: String,
    pub cached: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub bar_count: Option<usize>,
}

pub struct CacheStore {
    root: PathBuf,
    schema_version: u32,
    /// Published marker value; 0 means "no marker on disk".
    version: AtomicU32,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_schema_version(root, CACHE_SCHEMA_VERSION)
    }

    /// Store expecting a specific schema version (tests, migrations).
    pub fn with_schema_version(root: impl Into<PathBuf>, schema_version: u32) -> Self {
        let root = root.into();
        let on_disk = read_marker(&root).map(|m| m.version).unwrap_or(0);
        Self {
            root,
            schema_version,
            version: AtomicU32::new(on_disk),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File stem for an instrument. Characters outside `[A-Za-z0-9_-]` become
    /// `_`, and a BLAKE3 digest of the raw identifier is appended whenever
    /// anything was replaced so distinct identifiers never share a record.
    pub fn key_for(symbol: &str) -> String {
        let sanitized: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if sanitized == symbol && !symbol.is_empty() {
            sanitized
        } else {
            let digest = blake3::hash(symbol.as_bytes()).to_hex();
            format!("{sanitized}-{}", &digest[..8])
        }
    }

    fn record_path(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("{}.{RECORD_EXT}", Self::key_for(symbol)))
    }

    fn write_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(symbol.to_string()).or_default().clone()
    }

    /// Records written under another schema version are invisible.
    fn generation_matches(&self) -> bool {
        let published = self.version.load(Ordering::Acquire);
        published == 0 || published == self.schema_version
    }

    pub fn has(&self, symbol: &str) -> bool {
        self.generation_matches() && self.record_path(symbol).is_file()
    }

    /// Load a series. Missing, unreadable, and corrupt records all yield `None`.
    pub fn read(&self, symbol: &str) -> Option<BarSeries> {
        if !self.generation_matches() {
            return None;
        }
        let path = self.record_path(symbol);
        if !path.is_file() {
            return None;
        }
        match load_and_validate_parquet(&path) {
            Ok(series) => Some(series),
            Err(CacheError::CorruptRecord { path, reason }) => {
                warn!(symbol, path = %path.display(), %reason, "quarantining corrupt cache record");
                let _ = fs::rename(&path, path.with_extension("parquet.quarantined"));
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Replace the stored series atomically. Returns whether it was persisted.
    pub fn write(&self, symbol: &str, series: &BarSeries) -> bool {
        let lock = self.write_lock(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist(symbol, series)
    }

    /// Merge `new_bars` into the stored series by date and persist the result.
    ///
    /// Returns the merged series even if persisting it failed.
    pub fn merge(&self, symbol: &str, new_bars: impl IntoIterator<Item = Bar>) -> BarSeries {
        let lock = self.write_lock(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut series = self.read(symbol).unwrap_or_default();
        series.merge(new_bars);
        self.persist(symbol, &series);
        series
    }

    fn persist(&self, symbol: &str, series: &BarSeries) -> bool {
        if series.is_empty() {
            debug!(symbol, "refusing to cache an empty series");
            return false;
        }
        match self.try_persist(symbol, series) {
            Ok(()) => true,
            Err(e) => {
                warn!(symbol, error = %e, "cache write failed");
                false
            }
        }
    }

    fn try_persist(&self, symbol: &str, series: &BarSeries) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| CacheError::StorageUnavailable(format!("create {}: {e}", self.root.display())))?;
        if self.version.load(Ordering::Acquire) == 0 {
            self.publish_marker()?;
        }

        let path = self.record_path(symbol);
        let tmp_path = path.with_extension("parquet.tmp");
        let df = series_to_dataframe(series)?;
        write_parquet(&df, &tmp_path)?;

        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::StorageUnavailable(format!("atomic rename failed: {e}"))
        })
    }

    /// Version marker currently in force (0 when none has been written).
    pub fn current_version_tag(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Version this store writes.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Discard every record when the on-disk marker differs from the schema
    /// version, then stamp the new marker. Returns true if records were discarded.
    pub fn invalidate_if_version_changed(&self) -> bool {
        let on_disk = read_marker(&self.root).map(|m| m.version);
        if on_disk == Some(self.schema_version) {
            self.version.store(self.schema_version, Ordering::Release);
            return false;
        }

        let had_records = !self.cached_instruments().is_empty();
        if had_records {
            info!(
                from = ?on_disk,
                to = self.schema_version,
                "cache version changed, discarding all cached series"
            );
            self.remove_records();
        }
        if let Err(e) = self.publish_marker() {
            warn!(error = %e, "could not write cache version marker");
        }
        had_records
    }

    fn publish_marker(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| CacheError::StorageUnavailable(format!("create {}: {e}", self.root.display())))?;
        let marker = VersionMarker {
            version: self.schema_version,
            written_at: chrono::Utc::now().naive_utc(),
        };
        let json = serde_json::to_string_pretty(&marker)
            .map_err(|e| CacheError::StorageUnavailable(format!("marker serialization: {e}")))?;
        let path = self.root.join(MARKER_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| CacheError::StorageUnavailable(format!("marker write: {e}")))?;
        self.version.store(self.schema_version, Ordering::Release);
        Ok(())
    }

    /// Remove one instrument's record, or every record when `symbol` is `None`.
    pub fn clear(&self, symbol: Option<&str>) {
        match symbol {
            Some(sym) => {
                let lock = self.write_lock(sym);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let path = self.record_path(sym);
                if path.exists() {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(symbol = sym, error = %e, "failed to remove cache record");
                    }
                }
            }
            None => self.remove_records(),
        }
    }

    fn remove_records(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MARKER_FILE || !name.contains(".parquet") {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove cache record");
            }
        }
    }

    /// Record keys currently on disk, sorted.
    pub fn cached_instruments(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        keys.sort();
        keys
    }

    /// Date range and size per instrument.
    pub fn status(&self, symbols: &[&str]) -> Vec<CacheStatus> {
        symbols
            .iter()
            .map(|sym| {
                let series = self.read(sym);
                CacheStatus {
                    symbol: sym.to_string(),
                    cached: series.is_some(),
                    start_date: series.as_ref().and_then(BarSeries::first_date),
                    end_date: series.as_ref().and_then(BarSeries::last_date),
                    bar_count: series.as_ref().map(BarSeries::len),
                }
            })
            .collect()
    }
}

fn read_marker(root: &Path) -> Option<VersionMarker> {
    let content = fs::read_to_string(root.join(MARKER_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn series_to_dataframe(series: &BarSeries) -> Result<DataFrame, CacheError> {
    let bars = series.bars();
    let epoch = epoch();
    let dates: Vec<i32> = bars.iter().map(|b| (b.date - epoch).num_days() as i32).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<u64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| CacheError::StorageUnavailable(format!("date cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| CacheError::StorageUnavailable(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), CacheError> {
    let file = fs::File::create(path)
        .map_err(|e| CacheError::StorageUnavailable(format!("create {}: {e}", path.display())))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| CacheError::StorageUnavailable(format!("write parquet: {e}")))?;
    Ok(())
}

/// Load a record and check it: expected columns, at least one row, no nulls,
/// strictly increasing dates. Anything else is a corrupt record.
fn load_and_validate_parquet(path: &Path) -> Result<BarSeries, CacheError> {
    let corrupt = |reason: String| CacheError::CorruptRecord {
        path: path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(path)
        .map_err(|e| CacheError::StorageUnavailable(format!("open {}: {e}", path.display())))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| corrupt(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(corrupt("empty record".into()));
    }
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(corrupt(format!("missing column '{name}'")));
        }
    }

    let column_err = |e: PolarsError| corrupt(format!("column read: {e}"));
    let date_ca = df.column("date").and_then(|c| c.date()).map_err(column_err)?;
    let open_ca = df.column("open").and_then(|c| c.f64()).map_err(column_err)?;
    let high_ca = df.column("high").and_then(|c| c.f64()).map_err(column_err)?;
    let low_ca = df.column("low").and_then(|c| c.f64()).map_err(column_err)?;
    let close_ca = df.column("close").and_then(|c| c.f64()).map_err(column_err)?;
    let vol_ca = df.column("volume").and_then(|c| c.u64()).map_err(column_err)?;

    let epoch = epoch();
    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let row = (
            date_ca.get(i),
            open_ca.get(i),
            high_ca.get(i),
            low_ca.get(i),
            close_ca.get(i),
            vol_ca.get(i),
        );
        let (Some(days), Some(open), Some(high), Some(low), Some(close), Some(volume)) = row else {
            return Err(corrupt(format!("null value at row {i}")));
        };
        bars.push(Bar {
            date: epoch + chrono::Duration::days(days as i64),
            open,
            high,
            low,
            close,
            volume,
        });
    }

    if !BarSeries::is_strictly_increasing(&bars) {
        return Err(corrupt("dates not strictly increasing".into()));
    }
    Ok(BarSeries::from_bars(bars))
}
