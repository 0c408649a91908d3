//! DuckDB persistence for barsync series buffers.
//!
//! Each series is stored as its bars plus its coverage ranges, keyed by the
//! series key's display form (`AAPL@5m`). Timestamps are unix seconds.

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use duckdb::{ConnectionPool, PooledConnection};

pub const ENV_HOME: &str = "BARSYNC_HOME";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid stored record for '{series_key}': {reason}")]
    InvalidRecord { series_key: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::in_home(resolve_home())
    }
}

impl WarehouseConfig {
    /// Layout rooted at `home`: `<home>/cache/series.duckdb`.
    pub fn in_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let db_path = home.join("cache").join("series.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Half-open `[start, end)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_key: String,
    pub bars: Vec<BarRecord>,
    pub coverage: Vec<CoverageRecord>,
}

#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    pool: ConnectionPool,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, pool };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    /// Replace everything stored for `record.series_key` in one transaction.
    pub fn save_series(&self, record: &SeriesRecord) -> Result<(), WarehouseError> {
        let mut connection = self.pool.acquire()?;
        let tx = connection.transaction()?;
        let key = record.series_key.as_str();

        tx.execute("DELETE FROM series_bars WHERE series_key = ?", [key])?;
        tx.execute("DELETE FROM series_coverage WHERE series_key = ?", [key])?;
        tx.execute("DELETE FROM series_manifest WHERE series_key = ?", [key])?;
        {
            let mut insert_bar = tx.prepare(
                "INSERT INTO series_bars (series_key, ts, open, high, low, close, volume) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for bar in &record.bars {
                insert_bar.execute(params![
                    key,
                    bar.ts,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    i64::try_from(bar.volume).unwrap_or(i64::MAX),
                ])?;
            }

            let mut insert_range = tx.prepare(
                "INSERT INTO series_coverage (series_key, range_start, range_end) VALUES (?, ?, ?)",
            )?;
            for range in &record.coverage {
                insert_range.execute(params![key, range.start, range.end])?;
            }
        }
        tx.execute(
            "INSERT INTO series_manifest (series_key, bar_count) VALUES (?, ?)",
            params![key, i64::try_from(record.bars.len()).unwrap_or(i64::MAX)],
        )?;
        tx.commit()?;

        debug!(
            series_key = key,
            bars = record.bars.len(),
            ranges = record.coverage.len(),
            "saved series"
        );
        Ok(())
    }

    /// Stored bars and coverage for `series_key`, or `None` if it was never saved.
    pub fn load_series(&self, series_key: &str) -> Result<Option<SeriesRecord>, WarehouseError> {
        let connection = self.pool.acquire()?;
        let known: i64 = connection.query_row(
            "SELECT COUNT(*) FROM series_manifest WHERE series_key = ?",
            [series_key],
            |row| row.get(0),
        )?;
        if known == 0 {
            return Ok(None);
        }

        let mut bars_stmt = connection.prepare(
            "SELECT ts, open, high, low, close, volume FROM series_bars \
             WHERE series_key = ? ORDER BY ts",
        )?;
        let bars = bars_stmt
            .query_map([series_key], |row| {
                let volume: i64 = row.get(5)?;
                Ok(BarRecord {
                    ts: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: u64::try_from(volume).unwrap_or(0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut coverage_stmt = connection.prepare(
            "SELECT range_start, range_end FROM series_coverage \
             WHERE series_key = ? ORDER BY range_start",
        )?;
        let coverage = coverage_stmt
            .query_map([series_key], |row| {
                Ok(CoverageRecord {
                    start: row.get(0)?,
                    end: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(bad) = coverage.iter().find(|range| range.start >= range.end) {
            return Err(WarehouseError::InvalidRecord {
                series_key: series_key.to_owned(),
                reason: format!("empty coverage range [{}, {})", bad.start, bad.end),
            });
        }

        Ok(Some(SeriesRecord {
            series_key: series_key.to_owned(),
            bars,
            coverage,
        }))
    }

    pub fn series_keys(&self) -> Result<Vec<String>, WarehouseError> {
        let connection = self.pool.acquire()?;
        let mut stmt =
            connection.prepare("SELECT series_key FROM series_manifest ORDER BY series_key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn delete_series(&self, series_key: &str) -> Result<bool, WarehouseError> {
        let mut connection = self.pool.acquire()?;
        let tx = connection.transaction()?;
        tx.execute("DELETE FROM series_bars WHERE series_key = ?", [series_key])?;
        tx.execute("DELETE FROM series_coverage WHERE series_key = ?", [series_key])?;
        let removed = tx.execute("DELETE FROM series_manifest WHERE series_key = ?", [series_key])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

fn resolve_home() -> PathBuf {
    if let Some(path) = env::var_os(ENV_HOME) {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".barsync");
    }

    PathBuf::from(".barsync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Warehouse) {
        let temp = tempdir().expect("tempdir");
        let warehouse =
            Warehouse::open(WarehouseConfig::in_home(temp.path().join("home"))).expect("open");
        (temp, warehouse)
    }

    fn record(key: &str, bars: usize) -> SeriesRecord {
        SeriesRecord {
            series_key: key.to_owned(),
            bars: (0..bars as i64)
                .map(|n| BarRecord {
                    ts: 1_704_067_200 + n * 60,
                    open: 10.0,
                    high: 11.0,
                    low: 9.0,
                    close: 10.5,
                    volume: 100 + n as u64,
                })
                .collect(),
            coverage: vec![CoverageRecord {
                start: 1_704_067_200,
                end: 1_704_067_200 + bars as i64 * 60,
            }],
        }
    }

    #[test]
    fn creates_database_under_home() {
        let (temp, warehouse) = open_temp();
        assert!(warehouse.db_path().starts_with(temp.path()));
        assert!(warehouse.db_path().exists());
    }

    #[test]
    fn save_replaces_previous_contents() {
        let (_temp, warehouse) = open_temp();
        warehouse.save_series(&record("AAPL@1m", 5)).expect("first save");
        warehouse.save_series(&record("AAPL@1m", 2)).expect("second save");

        let loaded = warehouse
            .load_series("AAPL@1m")
            .expect("load")
            .expect("stored");
        assert_eq!(loaded, record("AAPL@1m", 2));
    }

    #[test]
    fn unknown_series_loads_as_none() {
        let (_temp, warehouse) = open_temp();
        assert!(warehouse.load_series("MSFT@1d").expect("load").is_none());
        assert!(warehouse.series_keys().expect("keys").is_empty());
    }

    #[test]
    fn delete_removes_series() {
        let (_temp, warehouse) = open_temp();
        warehouse.save_series(&record("AAPL@1m", 1)).expect("save");
        warehouse.save_series(&record("MSFT@5m", 1)).expect("save");

        assert!(warehouse.delete_series("AAPL@1m").expect("delete"));
        assert_eq!(warehouse.series_keys().expect("keys"), vec!["MSFT@5m"]);
    }
}
