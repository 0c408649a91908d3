//! Turns "I want this window" into bounded, prioritizable fetch requests.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::SeriesStore;
use crate::{CoverageRange, Granularity, SeriesKey, UtcDateTime};

/// Opaque, process-unique request identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifier of a batch of related requests tracked together by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(u64);

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Why a request exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    CatchUp,
    Refetch,
    Backfill,
    LiveTail,
    Retry,
}

impl RequestKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CatchUp => "catch_up",
            Self::Refetch => "refetch",
            Self::Backfill => "backfill",
            Self::LiveTail => "live_tail",
            Self::Retry => "retry",
        }
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer or stream owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One bounded request for `[range.start, range.end)` of `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub key: SeriesKey,
    pub range: CoverageRange,
    pub owner: OwnerId,
    pub keep_alive: bool,
}

/// Shared id source for requests and groups.
#[derive(Debug, Clone, Default)]
pub struct RequestIdAllocator {
    next: Arc<AtomicU64>,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_request(&self) -> RequestId {
        RequestId(self.bump())
    }

    pub fn next_group(&self) -> GroupId {
        GroupId(self.bump())
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Computes missing ranges and splits them into request-sized chunks.
#[derive(Debug, Clone)]
pub struct FetchPlanner {
    store: Arc<SeriesStore>,
    clock: Arc<dyn Clock>,
    ids: RequestIdAllocator,
}

impl FetchPlanner {
    pub fn new(store: Arc<SeriesStore>, clock: Arc<dyn Clock>, ids: RequestIdAllocator) -> Self {
        Self { store, clock, ids }
    }

    pub fn ids(&self) -> &RequestIdAllocator {
        &self.ids
    }

    pub fn now(&self) -> UtcDateTime {
        self.clock.now()
    }

    /// Standard lookback window for `granularity`, from a bar boundary up to now.
    pub fn lookback_window(&self, granularity: Granularity) -> Option<CoverageRange> {
        let now = self.now();
        let start = now
            .add_seconds(-granularity.lookback_seconds())
            .floor_to(granularity.seconds());
        CoverageRange::non_empty(start, now)
    }

    /// Plan requests that bring `desired` (or the full lookback window) into coverage.
    ///
    /// Chunks are returned newest first. With `keep_alive` the newest chunk
    /// becomes a live tail and the rest stay one-shot.
    pub fn plan(
        &self,
        key: &SeriesKey,
        desired: CoverageRange,
        full_refetch: bool,
        owner: OwnerId,
        keep_alive: bool,
    ) -> Vec<FetchRequest> {
        let now = self.now();
        let (gaps, kind) = if full_refetch {
            self.store.clear_coverage(key);
            let window = self.lookback_window(key.granularity);
            (window.into_iter().collect::<Vec<_>>(), RequestKind::Refetch)
        } else {
            (
                self.store.coverage(key).missing_ranges(desired, now),
                RequestKind::CatchUp,
            )
        };

        let span = key.granularity.max_request_seconds();
        let mut chunks: Vec<CoverageRange> = gaps
            .iter()
            .rev()
            .flat_map(|gap| split_backward(*gap, span))
            .collect();
        // Gaps are already visited newest first; keep ordering explicit for overlapping spans.
        chunks.sort_by(|left, right| right.end().cmp(&left.end()));

        let requests: Vec<_> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let tail = keep_alive && index == 0;
                FetchRequest {
                    id: self.ids.next_request(),
                    kind: if tail { RequestKind::LiveTail } else { kind },
                    key: key.clone(),
                    range,
                    owner,
                    keep_alive: tail,
                }
            })
            .collect();

        debug!(
            key = %key,
            full_refetch,
            keep_alive,
            requests = requests.len(),
            "planned fetch"
        );
        requests
    }

    /// Plan a one-shot backfill of `desired` on `key`, chunked like [`FetchPlanner::plan`].
    pub fn plan_backfill(
        &self,
        key: &SeriesKey,
        desired: CoverageRange,
        owner: OwnerId,
    ) -> Vec<FetchRequest> {
        self.plan(key, desired, false, owner, false)
            .into_iter()
            .map(|request| FetchRequest {
                kind: RequestKind::Backfill,
                ..request
            })
            .collect()
    }

    /// Single keep-alive request from `since` (floored to the bar boundary) to now.
    pub fn plan_tail(&self, key: &SeriesKey, since: UtcDateTime, owner: OwnerId) -> Option<FetchRequest> {
        let step = key.granularity.seconds();
        let now = self.now();
        let start = since.floor_to(step).min(now.floor_to(step));
        let range = CoverageRange::non_empty(start, now)
            .or_else(|| CoverageRange::non_empty(start, start.add_seconds(step)))?;
        Some(FetchRequest {
            id: self.ids.next_request(),
            kind: RequestKind::LiveTail,
            key: key.clone(),
            range,
            owner,
            keep_alive: true,
        })
    }
}

/// Split `gap` into spans of at most `span` seconds walking back from its end.
///
/// Output is newest first.
fn split_backward(gap: CoverageRange, span: i64) -> Vec<CoverageRange> {
    let mut chunks = Vec::new();
    let mut end = gap.end();
    while end > gap.start() {
        let start = end.add_seconds(-span).max(gap.start());
        match CoverageRange::non_empty(start, end) {
            Some(chunk) => chunks.push(chunk),
            None => break,
        }
        end = start;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::Symbol;

    const DAY: i64 = 86_400;

    fn day(n: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(1_704_067_200 + n * DAY).expect("timestamp")
    }

    fn planner_at(now: UtcDateTime) -> (FetchPlanner, Arc<SeriesStore>) {
        let store = Arc::new(SeriesStore::new(false));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        (
            FetchPlanner::new(Arc::clone(&store), clock, RequestIdAllocator::new()),
            store,
        )
    }

    fn key(granularity: Granularity) -> SeriesKey {
        SeriesKey::new(Symbol::parse("AAPL").expect("symbol"), granularity)
    }

    #[test]
    fn splits_long_gap_newest_first() {
        let (planner, _) = planner_at(day(30));
        let desired = CoverageRange::new(day(0), day(3)).expect("range");

        let requests = planner.plan(&key(Granularity::OneMinute), desired, false, OwnerId::new(), false);

        let ranges: Vec<_> = requests.iter().map(|request| request.range).collect();
        assert_eq!(
            ranges,
            vec![
                CoverageRange::new(day(2), day(3)).expect("range"),
                CoverageRange::new(day(1), day(2)).expect("range"),
                CoverageRange::new(day(0), day(1)).expect("range"),
            ]
        );
        assert!(requests.iter().all(|request| request.kind == RequestKind::CatchUp));
    }

    #[test]
    fn keep_alive_marks_only_newest_chunk() {
        let (planner, _) = planner_at(day(30));
        let desired = CoverageRange::new(day(27), day(30)).expect("range");

        let requests = planner.plan(&key(Granularity::OneMinute), desired, false, OwnerId::new(), true);

        assert_eq!(requests.len(), 3);
        assert!(requests[0].keep_alive);
        assert_eq!(requests[0].kind, RequestKind::LiveTail);
        assert!(requests[1..].iter().all(|request| !request.keep_alive));
    }

    #[test]
    fn full_refetch_clears_coverage_and_uses_lookback() {
        let (planner, store) = planner_at(day(30));
        let key = key(Granularity::FiveMinutes);
        let covered = CoverageRange::new(day(20), day(30)).expect("range");
        store.merge_new_data(&key, Vec::new(), Some(covered));

        let requests = planner.plan(&key, covered, true, OwnerId::new(), false);

        assert!(store.coverage(&key).is_empty());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, RequestKind::Refetch);
        assert_eq!(requests[0].range.seconds(), 7 * DAY);
    }

    #[test]
    fn lookback_starts_on_bar_boundary() {
        let now = day(10).add_seconds(5_555);
        let (planner, _) = planner_at(now);

        let window = planner.lookback_window(Granularity::OneHour).expect("window");

        assert_eq!(window.start().unix_timestamp() % 3_600, 0);
        assert_eq!(window.end(), now);
    }

    #[test]
    fn ids_are_never_reused() {
        let ids = RequestIdAllocator::new();
        let first = ids.next_request();
        let group = ids.next_group();
        let second = ids.next_request();
        assert!(first < second);
        assert_ne!(first.get(), second.get());
        assert_eq!(group.to_string(), "group-2");
    }

    #[test]
    fn tail_starts_on_bar_boundary() {
        let now = day(10).add_seconds(3_725);
        let (planner, _) = planner_at(now);

        let tail = planner
            .plan_tail(&key(Granularity::FiveMinutes), now.add_seconds(-1_000), OwnerId::new())
            .expect("tail");
        assert!(tail.keep_alive);
        assert_eq!(tail.range.start().unix_timestamp() % 300, 0);
        assert_eq!(tail.range.end(), now);
    }
}
