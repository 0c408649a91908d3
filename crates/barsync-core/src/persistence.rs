//! Save and restore `{bars, coverage}` per series key.

use std::collections::HashMap;
use std::sync::Arc;

use barsync_warehouse::{BarRecord, CoverageRecord, SeriesRecord, Warehouse, WarehouseError};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::store::{SeriesSnapshot, SeriesStore};
use crate::{Bar, CoverageRange, CoverageSet, SeriesKey, UtcDateTime, ValidationError};

/// Storage used to seed the cache on restart without refetching.
pub trait SeriesPersistence: Send + Sync {
    fn save(&self, snapshot: &SeriesSnapshot) -> Result<(), SyncError>;
    fn load(&self, key: &SeriesKey) -> Result<Option<(Vec<Bar>, CoverageSet)>, SyncError>;
    fn keys(&self) -> Result<Vec<SeriesKey>, SyncError>;
}

impl SeriesPersistence for Warehouse {
    fn save(&self, snapshot: &SeriesSnapshot) -> Result<(), SyncError> {
        self.save_series(&to_record(snapshot))?;
        Ok(())
    }

    fn load(&self, key: &SeriesKey) -> Result<Option<(Vec<Bar>, CoverageSet)>, SyncError> {
        self.load_series(&key.to_string())?
            .map(|record| from_record(&record))
            .transpose()
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, SyncError> {
        let mut keys = Vec::new();
        for raw in self.series_keys()? {
            match SeriesKey::parse(&raw) {
                Ok(key) => keys.push(key),
                Err(error) => warn!(series_key = %raw, error = %error, "skipping stored series"),
            }
        }
        Ok(keys)
    }
}

/// Process-local persistence, handy for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    series: Arc<RwLock<HashMap<SeriesKey, (Vec<Bar>, CoverageSet)>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }
}

impl SeriesPersistence for InMemoryPersistence {
    fn save(&self, snapshot: &SeriesSnapshot) -> Result<(), SyncError> {
        self.series.write().insert(
            snapshot.key.clone(),
            (snapshot.bars.clone(), snapshot.coverage.clone()),
        );
        Ok(())
    }

    fn load(&self, key: &SeriesKey) -> Result<Option<(Vec<Bar>, CoverageSet)>, SyncError> {
        Ok(self.series.read().get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, SyncError> {
        let mut keys: Vec<_> = self.series.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

impl SeriesStore {
    /// Save every non-empty buffer. Returns how many series were written.
    pub fn persist_all(&self, target: &dyn SeriesPersistence) -> Result<usize, SyncError> {
        let mut saved = 0;
        for key in self.keys() {
            let snapshot = self.get(&key);
            if snapshot.bars.is_empty() && snapshot.coverage.is_empty() {
                continue;
            }
            target.save(&snapshot)?;
            saved += 1;
        }
        info!(series = saved, "persisted series buffers");
        Ok(saved)
    }

    /// Seed buffers from `source`. Returns how many series were restored.
    pub fn load_from(&self, source: &dyn SeriesPersistence) -> Result<usize, SyncError> {
        let mut restored = 0;
        for key in source.keys()? {
            if let Some((bars, coverage)) = source.load(&key)? {
                self.seed(&key, bars, coverage);
                restored += 1;
            }
        }
        info!(series = restored, "restored series buffers");
        Ok(restored)
    }
}

fn to_record(snapshot: &SeriesSnapshot) -> SeriesRecord {
    SeriesRecord {
        series_key: snapshot.key.to_string(),
        bars: snapshot
            .bars
            .iter()
            .map(|bar| BarRecord {
                ts: bar.ts.unix_timestamp(),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            })
            .collect(),
        coverage: snapshot
            .coverage
            .ranges()
            .iter()
            .map(|range| CoverageRecord {
                start: range.start().unix_timestamp(),
                end: range.end().unix_timestamp(),
            })
            .collect(),
    }
}

fn from_record(record: &SeriesRecord) -> Result<(Vec<Bar>, CoverageSet), SyncError> {
    let invalid = |error: ValidationError| {
        SyncError::Persistence(WarehouseError::InvalidRecord {
            series_key: record.series_key.clone(),
            reason: error.to_string(),
        })
    };

    let bars = record
        .bars
        .iter()
        .map(|row| {
            let ts = UtcDateTime::from_unix_timestamp(row.ts)?;
            Ok(Bar {
                ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()
        .map_err(invalid)?;

    let ranges = record
        .coverage
        .iter()
        .map(|row| {
            CoverageRange::new(
                UtcDateTime::from_unix_timestamp(row.start)?,
                UtcDateTime::from_unix_timestamp(row.end)?,
            )
        })
        .collect::<Result<Vec<_>, ValidationError>>()
        .map_err(invalid)?;

    Ok((bars, CoverageSet::from_ranges(ranges)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Granularity, Symbol};

    #[test]
    fn in_memory_round_trip_restores_bars_and_coverage() {
        let source = SeriesStore::new(false);
        let key = SeriesKey::new(Symbol::parse("SPY").expect("symbol"), Granularity::OneDay);
        let start = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("timestamp");
        let bar = Bar::new(start, 470.0, 475.0, 468.0, 474.0, 1_000).expect("bar");
        let range = CoverageRange::new(start, start.add_seconds(86_400)).expect("range");
        source.merge_new_data(&key, vec![bar.clone()], Some(range));

        let persistence = InMemoryPersistence::new();
        assert_eq!(source.persist_all(&persistence).expect("persist"), 1);

        let restored = SeriesStore::new(false);
        assert_eq!(restored.load_from(&persistence).expect("load"), 1);
        let snapshot = restored.get(&key);
        assert_eq!(snapshot.bars, vec![bar]);
        assert!(snapshot.coverage.contains(&range));
    }
}
