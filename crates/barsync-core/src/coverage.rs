//! Fetched-range bookkeeping for one series.

use serde::{Deserialize, Serialize};

use crate::{CoverageRange, UtcDateTime};

/// Sorted set of disjoint, non-touching coverage ranges.
///
/// Every mutation leaves the ranges sorted by start with a strict gap between
/// neighbours; ranges that overlap or touch (`end == start`) are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverageSet {
    ranges: Vec<CoverageRange>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary ranges, normalizing as it goes.
    pub fn from_ranges(ranges: impl IntoIterator<Item = CoverageRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.add_range(range);
        }
        set
    }

    /// Merge `range` into the set. Returns `true` if coverage grew.
    pub fn add_range(&mut self, range: CoverageRange) -> bool {
        if self.contains(&range) {
            return false;
        }

        // First range whose end reaches the new start; everything before stays put.
        let first = self.ranges.partition_point(|existing| existing.end() < range.start());
        let mut start = range.start();
        let mut end = range.end();
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start() <= end {
            start = start.min(self.ranges[last].start());
            end = end.max(self.ranges[last].end());
            last += 1;
        }

        let merged = CoverageRange::non_empty(start, end).unwrap_or(range);
        self.ranges.splice(first..last, [merged]);
        true
    }

    /// Gaps of `desired` not yet covered, oldest first, never extending past `now`.
    pub fn missing_ranges(&self, desired: CoverageRange, now: UtcDateTime) -> Vec<CoverageRange> {
        let Some(desired) = desired.clip_end(now) else {
            return Vec::new();
        };

        let mut gaps = Vec::new();
        let mut cursor = desired.start();
        for covered in &self.ranges {
            if covered.end() <= cursor {
                continue;
            }
            if covered.start() >= desired.end() {
                break;
            }
            if let Some(gap) = CoverageRange::non_empty(cursor, covered.start().min(desired.end()))
            {
                gaps.push(gap);
            }
            cursor = cursor.max(covered.end());
            if cursor >= desired.end() {
                break;
            }
        }

        if let Some(tail) = CoverageRange::non_empty(cursor, desired.end()) {
            gaps.push(tail);
        }
        gaps
    }

    /// Whether `range` lies entirely inside one covered span.
    pub fn contains(&self, range: &CoverageRange) -> bool {
        self.covering(range.start())
            .is_some_and(|covered| covered.contains(range))
    }

    /// The covered span containing `ts`, if any.
    pub fn covering(&self, ts: UtcDateTime) -> Option<&CoverageRange> {
        let index = self.ranges.partition_point(|existing| existing.end() <= ts);
        self.ranges
            .get(index)
            .filter(|candidate| candidate.contains_instant(ts))
    }

    /// End of the most recent covered span.
    pub fn last_end(&self) -> Option<UtcDateTime> {
        self.ranges.last().map(CoverageRange::end)
    }

    pub fn ranges(&self) -> &[CoverageRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
