//! Per-key bar buffers with coverage tracking and fine→coarse propagation.
//!
//! Each [`SeriesKey`] owns one [`SeriesBuffer`] behind its own reader/writer
//! lock, so readers of one symbol never contend with writers of another.
//! Writes for one symbol are serialized by a per-symbol writer lock held
//! from the fine merge until the last derived write. Inside it, propagation
//! walks from a finer granularity to a coarser one and releases the source
//! lock before taking the derived lock.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{Bar, CoverageRange, CoverageSet, Granularity, SeriesKey, Symbol, UtcDateTime};

const CHANGE_CHANNEL_CAPACITY: usize = 1_024;

/// Bars plus coverage for one series. Only reachable through [`SeriesStore`].
#[derive(Debug, Default)]
pub struct SeriesBuffer {
    bars: Vec<Bar>,
    coverage: CoverageSet,
}

/// Immutable copy of a buffer taken under its read lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub bars: Vec<Bar>,
    pub coverage: CoverageSet,
}

impl SeriesSnapshot {
    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn bars_in(&self, range: &CoverageRange) -> &[Bar] {
        let start = self.bars.partition_point(|bar| bar.ts < range.start());
        let end = self.bars.partition_point(|bar| bar.ts < range.end());
        &self.bars[start..end]
    }
}

/// Change notification consumed by indicator and rendering layers.
///
/// Derived state for `key` and every entry of `affected_keys` can be
/// recomputed from `first_changed` onwards instead of from scratch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub key: SeriesKey,
    pub affected_keys: Vec<SeriesKey>,
    pub first_changed: Option<UtcDateTime>,
}

/// What a single merge did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub amended: usize,
    pub dropped: usize,
    pub coverage_grew: bool,
    pub first_changed: Option<UtcDateTime>,
    pub affected_keys: Vec<SeriesKey>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.amended > 0 || self.coverage_grew
    }
}

#[derive(Debug, Default)]
struct BarDelta {
    inserted: usize,
    amended: usize,
    first: Option<UtcDateTime>,
    last: Option<UtcDateTime>,
}

impl BarDelta {
    fn touch(&mut self, ts: UtcDateTime) {
        self.first = Some(self.first.map_or(ts, |first| first.min(ts)));
        self.last = Some(self.last.map_or(ts, |last| last.max(ts)));
    }

    fn changed(&self) -> bool {
        self.inserted > 0 || self.amended > 0
    }

    /// Span from the first touched bar to the end of the last one.
    fn span(&self, step: i64) -> Option<CoverageRange> {
        CoverageRange::non_empty(self.first?, self.last?.add_seconds(step))
    }
}

/// Smallest range containing both inputs.
fn hull(left: Option<CoverageRange>, right: Option<CoverageRange>) -> Option<CoverageRange> {
    match (left, right) {
        (Some(left), Some(right)) => {
            CoverageRange::non_empty(left.start().min(right.start()), left.end().max(right.end()))
        }
        (one, None) | (None, one) => one,
    }
}

impl SeriesBuffer {
    /// Insert or amend each bar; `bars` must be sorted and aligned.
    fn apply_amendments(&mut self, bars: &[Bar]) -> BarDelta {
        let mut delta = BarDelta::default();
        for bar in bars {
            match self.bars.binary_search_by(|existing| existing.ts.cmp(&bar.ts)) {
                Ok(index) => {
                    if self.bars[index].amend(bar) {
                        delta.amended += 1;
                        delta.touch(bar.ts);
                    }
                }
                Err(index) => {
                    self.bars.insert(index, bar.clone());
                    delta.inserted += 1;
                    delta.touch(bar.ts);
                }
            }
        }
        delta
    }

    /// Write aggregates of `step`-second windows.
    ///
    /// An aggregate is built from every stored fine bar of its window and
    /// replaces the coarse bar. The exception is a coarse bar fetched for a
    /// window this series already covers while the fine data is partial:
    /// that bar is amended so fields the fine bars lack survive.
    fn apply_derived(&mut self, derived: &[(Bar, bool)], step: i64) -> BarDelta {
        let mut delta = BarDelta::default();
        for (bar, fine_complete) in derived {
            match self.bars.binary_search_by(|existing| existing.ts.cmp(&bar.ts)) {
                Ok(index) => {
                    let fetched = !*fine_complete
                        && CoverageRange::non_empty(bar.ts, bar.ts.add_seconds(step))
                            .is_some_and(|window| self.coverage.contains(&window));
                    let changed = if fetched {
                        self.bars[index].amend(bar)
                    } else if self.bars[index] != *bar {
                        self.bars[index] = bar.clone();
                        true
                    } else {
                        false
                    };
                    if changed {
                        delta.amended += 1;
                        delta.touch(bar.ts);
                    }
                }
                Err(index) => {
                    self.bars.insert(index, bar.clone());
                    delta.inserted += 1;
                    delta.touch(bar.ts);
                }
            }
        }
        delta
    }

    fn bars_between(&self, start: UtcDateTime, end: UtcDateTime) -> Vec<Bar> {
        let from = self.bars.partition_point(|bar| bar.ts < start);
        let to = self.bars.partition_point(|bar| bar.ts < end);
        self.bars[from..to].to_vec()
    }
}

/// Owner of every series buffer in the process.
#[derive(Debug)]
pub struct SeriesStore {
    buffers: DashMap<SeriesKey, Arc<RwLock<SeriesBuffer>>>,
    writers: DashMap<Symbol, Arc<Mutex<()>>>,
    propagate: bool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SeriesStore {
    pub fn new(propagate: bool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            buffers: DashMap::new(),
            writers: DashMap::new(),
            propagate,
            changes,
        }
    }

    pub fn propagates(&self) -> bool {
        self.propagate
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Snapshot copy of the buffer for `key`, creating an empty buffer on first access.
    pub fn get(&self, key: &SeriesKey) -> SeriesSnapshot {
        let buffer = self.buffer(key);
        let guard = buffer.read();
        SeriesSnapshot {
            key: key.clone(),
            bars: guard.bars.clone(),
            coverage: guard.coverage.clone(),
        }
    }

    pub fn coverage(&self, key: &SeriesKey) -> CoverageSet {
        self.buffer(key).read().coverage.clone()
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<_> = self.buffers.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Forget what was fetched for `key` while keeping its bars.
    pub fn clear_coverage(&self, key: &SeriesKey) {
        self.buffer(key).write().coverage.clear();
        debug!(key = %key, "coverage cleared");
    }

    /// Replace a buffer wholesale, e.g. from persisted state. No propagation.
    pub fn seed(&self, key: &SeriesKey, bars: Vec<Bar>, coverage: CoverageSet) -> usize {
        let prepared = prepare_batch(key.granularity, bars);
        let buffer = self.buffer(key);
        let mut guard = buffer.write();
        guard.bars.clear();
        let delta = guard.apply_amendments(&prepared.bars);
        guard.coverage = coverage;
        if prepared.dropped > 0 {
            warn!(key = %key, dropped = prepared.dropped, "malformed bars skipped while seeding");
        }
        delta.inserted
    }

    /// Integrate `bars` into the buffer for `key` and record `source_range` as covered.
    ///
    /// Same-timestamp bars are amended (open kept, close replaced, high/low
    /// widened, volume maxed). Empty or malformed batches never corrupt the
    /// buffer; an empty batch with a range only extends coverage.
    pub fn merge_new_data(
        &self,
        key: &SeriesKey,
        bars: Vec<Bar>,
        source_range: Option<CoverageRange>,
    ) -> MergeOutcome {
        let prepared = prepare_batch(key.granularity, bars);
        if prepared.dropped > 0 {
            warn!(key = %key, dropped = prepared.dropped, "malformed bars dropped from batch");
        }

        let writer = self.writer(&key.symbol);
        let serial = writer.lock();

        let buffer = self.buffer(key);
        let (delta, coverage_grew, covered_span) = {
            let mut guard = buffer.write();
            let delta = guard.apply_amendments(&prepared.bars);
            let coverage_grew = source_range
                .map(|range| guard.coverage.add_range(range))
                .unwrap_or(false);
            let covered_span = source_range
                .and_then(|range| guard.coverage.covering(range.start()).copied());
            (delta, coverage_grew, covered_span)
        };

        let mut outcome = MergeOutcome {
            inserted: delta.inserted,
            amended: delta.amended,
            dropped: prepared.dropped,
            coverage_grew,
            first_changed: delta.first,
            affected_keys: Vec::new(),
        };

        if !outcome.changed() {
            return outcome;
        }

        if self.propagate {
            // Windows that just became complete all intersect the added range.
            let grown = if coverage_grew { source_range } else { None };
            let dirty = hull(delta.span(key.granularity.seconds()), grown);
            let span = if coverage_grew { covered_span } else { None };
            if let Some(dirty) = dirty {
                outcome.affected_keys = self.propagate_from(key, dirty, span);
            }
        }
        drop(serial);

        debug!(
            key = %key,
            inserted = outcome.inserted,
            amended = outcome.amended,
            coverage_grew = outcome.coverage_grew,
            affected = outcome.affected_keys.len(),
            "merged batch"
        );

        let _ = self.changes.send(ChangeEvent {
            key: key.clone(),
            affected_keys: outcome.affected_keys.clone(),
            first_changed: outcome.first_changed,
        });

        outcome
    }

    /// Recompute every coarser series derived (transitively) from `source`.
    ///
    /// `dirty` bounds the fine bars or coverage that changed; `span` is the
    /// grown fine coverage span, if any.
    fn propagate_from(
        &self,
        source: &SeriesKey,
        dirty: CoverageRange,
        span: Option<CoverageRange>,
    ) -> Vec<SeriesKey> {
        let mut affected = Vec::new();
        let mut queue = VecDeque::from([(source.clone(), dirty, span)]);

        while let Some((fine_key, dirty, span)) = queue.pop_front() {
            for granularity in fine_key.granularity.derivatives() {
                let coarse_key = fine_key.with_granularity(granularity);
                let step = granularity.seconds();
                let Some(windows) =
                    CoverageRange::non_empty(dirty.start().floor_to(step), dirty.end().ceil_to(step))
                else {
                    continue;
                };
                let (changed, grown) = self.derive_into(&fine_key, &coarse_key, windows, span);
                if changed || grown.is_some() {
                    if !affected.contains(&coarse_key) {
                        affected.push(coarse_key.clone());
                    }
                    queue.push_back((coarse_key, windows, grown));
                }
            }
        }

        affected
    }

    /// Rebuild the coarse windows inside `windows` from the fine series and
    /// extend coarse coverage by the whole windows of `span`.
    ///
    /// Returns whether any coarse bar changed and the grown coarse span.
    fn derive_into(
        &self,
        fine_key: &SeriesKey,
        coarse_key: &SeriesKey,
        windows: CoverageRange,
        span: Option<CoverageRange>,
    ) -> (bool, Option<CoverageRange>) {
        let step = coarse_key.granularity.seconds();
        let derived = {
            let fine = self.buffer(fine_key);
            let guard = fine.read();
            let fine_bars = guard.bars_between(windows.start(), windows.end());
            aggregate_windows(&fine_bars, &guard.coverage, step)
        };
        let coarse_range = span.and_then(|range| range.align_inward(step));

        let coarse = self.buffer(coarse_key);
        let mut guard = coarse.write();
        let delta = guard.apply_derived(&derived, step);
        let grown = coarse_range
            .filter(|range| guard.coverage.add_range(*range))
            .and_then(|range| guard.coverage.covering(range.start()).copied());

        (delta.changed(), grown)
    }

    fn writer(&self, symbol: &Symbol) -> Arc<Mutex<()>> {
        if let Some(existing) = self.writers.get(symbol) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.writers.entry(symbol.clone()).or_default().value())
    }

    fn buffer(&self, key: &SeriesKey) -> Arc<RwLock<SeriesBuffer>> {
        if let Some(existing) = self.buffers.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.buffers.entry(key.clone()).or_default().value())
    }
}

struct PreparedBatch {
    bars: Vec<Bar>,
    dropped: usize,
}

/// Screen, align and sort a raw batch. Later duplicates stay after earlier
/// ones so they amend in arrival order.
fn prepare_batch(granularity: Granularity, bars: Vec<Bar>) -> PreparedBatch {
    let total = bars.len();
    let step = granularity.seconds();
    let mut kept: Vec<Bar> = bars
        .into_iter()
        .filter(Bar::is_well_formed)
        .map(|mut bar| {
            bar.ts = bar.ts.floor_to(step);
            bar
        })
        .collect();
    let dropped = total - kept.len();
    kept.sort_by(|left, right| left.ts.cmp(&right.ts));
    PreparedBatch {
        bars: kept,
        dropped,
    }
}

/// Group time-ordered fine bars into aligned windows of `step` seconds.
///
/// Each result carries whether the fine coverage spans the whole window.
fn aggregate_windows(fine_bars: &[Bar], fine_coverage: &CoverageSet, step: i64) -> Vec<(Bar, bool)> {
    let mut derived = Vec::new();
    let mut index = 0;
    while index < fine_bars.len() {
        let window_start = fine_bars[index].ts.floor_to(step);
        let window_end = window_start.add_seconds(step);
        let len = fine_bars[index..]
            .iter()
            .take_while(|bar| bar.ts < window_end)
            .count();
        let members = &fine_bars[index..index + len];
        if let Some(bar) = Bar::aggregate(window_start, members) {
            let complete = CoverageRange::non_empty(window_start, window_end)
                .is_some_and(|window| fine_coverage.contains(&window));
            derived.push((bar, complete));
        }
        index += len.max(1);
    }
    derived
}
