//! Concurrency-capped request scheduler.
//!
//! Requests move `Pending → InFlight → {Completed, Cancelled, Errored}`;
//! keep-alive requests park in `Streaming` after their initial load. All
//! bookkeeping sits behind one mutex with short critical sections. Feed
//! calls, store merges and event fan-out happen after the lock is released.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::SyncError;
use crate::feed::{BrokerFeed, FeedError, FeedErrorKind, FeedEvent, FeedEventSink, FeedRequest};
use crate::planner::{FetchRequest, GroupId, OwnerId, RequestId, RequestIdAllocator, RequestKind};
use crate::store::SeriesStore;
use crate::throttling::ThrottlingQueue;
use crate::{Bar, CoverageRange, SeriesKey, UtcDateTime, ValidationError};

/// Where a request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    /// Waiting out a retry backoff.
    Delayed,
    InFlight,
    Streaming,
    /// Terminal; late callbacks are dropped until the grace period ends.
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed { bars: usize },
    /// Feed had nothing; the range is recorded as covered with zero bars.
    NoData,
    Cancelled,
    Failed { code: &'static str, message: String },
}

/// Notifications for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    RequestFinished {
        id: RequestId,
        key: SeriesKey,
        kind: RequestKind,
        outcome: RequestOutcome,
    },
    StreamStarted {
        id: RequestId,
        key: SeriesKey,
    },
    /// Fires once, when every member is terminal or streaming.
    GroupCompleted {
        group: GroupId,
        failed: usize,
        cancelled: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub streaming: usize,
    pub retired: usize,
    pub groups: usize,
}

#[derive(Debug, Clone)]
struct Tracked {
    request: FetchRequest,
    group: Option<GroupId>,
    attempt: u32,
    bars: usize,
    last_activity: Option<Instant>,
}

impl Tracked {
    fn new(request: FetchRequest, group: Option<GroupId>) -> Self {
        Self {
            request,
            group,
            attempt: 0,
            bars: 0,
            last_activity: None,
        }
    }
}

/// Heap entry: finer granularity first, then newest end, then oldest id.
#[derive(Debug)]
struct Prioritized(Tracked);

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        let (mine, theirs) = (&self.0.request, &other.0.request);
        theirs
            .key
            .granularity
            .cmp(&mine.key.granularity)
            .then_with(|| mine.range.end().cmp(&theirs.range.end()))
            .then_with(|| theirs.id.cmp(&mine.id))
    }
}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Prioritized {}

#[derive(Debug, Default)]
struct GroupState {
    outstanding: HashSet<RequestId>,
    failed: usize,
    cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct SchedulerState {
    pending: BinaryHeap<Prioritized>,
    delayed: HashMap<RequestId, Tracked>,
    in_flight: HashMap<RequestId, Tracked>,
    /// Dispatch time of each in-flight request.
    dispatched_at: HashMap<RequestId, Instant>,
    streaming: HashMap<RequestId, Tracked>,
    retired: HashMap<RequestId, Instant>,
    groups: HashMap<GroupId, GroupState>,
    dispatch_armed: bool,
    retire_grace: Duration,
}

impl SchedulerState {
    fn new(retire_grace: Duration) -> Self {
        Self {
            pending: BinaryHeap::new(),
            delayed: HashMap::new(),
            in_flight: HashMap::new(),
            dispatched_at: HashMap::new(),
            streaming: HashMap::new(),
            retired: HashMap::new(),
            groups: HashMap::new(),
            dispatch_armed: false,
            retire_grace,
        }
    }

    fn retire(&mut self, id: RequestId) {
        self.purge_retired();
        self.dispatched_at.remove(&id);
        self.retired.insert(id, Instant::now());
    }

    /// Forget ids retired longer than the grace period ago.
    fn purge_retired(&mut self) {
        let grace = self.retire_grace;
        self.retired.retain(|_, retired_at| retired_at.elapsed() < grace);
    }

    fn resolve(
        &mut self,
        group: Option<GroupId>,
        id: RequestId,
        resolution: Resolution,
    ) -> Option<SchedulerEvent> {
        let group_id = group?;
        let state = self.groups.get_mut(&group_id)?;
        if !state.outstanding.remove(&id) {
            return None;
        }
        match resolution {
            Resolution::Succeeded => {}
            Resolution::Failed => state.failed += 1,
            Resolution::Cancelled => state.cancelled += 1,
        }
        if !state.outstanding.is_empty() {
            return None;
        }
        let done = self.groups.remove(&group_id)?;
        Some(SchedulerEvent::GroupCompleted {
            group: group_id,
            failed: done.failed,
            cancelled: done.cancelled,
        })
    }

    fn replace_member(&mut self, group: Option<GroupId>, old: RequestId, new: RequestId) {
        if let Some(state) = group.and_then(|group| self.groups.get_mut(&group)) {
            if state.outstanding.remove(&old) {
                state.outstanding.insert(new);
            }
        }
    }

    fn take_active(&mut self, id: RequestId) -> Option<(Tracked, bool)> {
        if let Some(tracked) = self.in_flight.remove(&id) {
            return Some((tracked, true));
        }
        self.streaming.remove(&id).map(|tracked| (tracked, false))
    }

    fn state_of(&self, id: RequestId) -> Option<RequestState> {
        if self.in_flight.contains_key(&id) {
            Some(RequestState::InFlight)
        } else if self.streaming.contains_key(&id) {
            Some(RequestState::Streaming)
        } else if self.delayed.contains_key(&id) {
            Some(RequestState::Delayed)
        } else if self.retired.contains_key(&id) {
            Some(RequestState::Retired)
        } else if self.pending.iter().any(|entry| entry.0.request.id == id) {
            Some(RequestState::Pending)
        } else {
            None
        }
    }
}

/// Side effects collected under the lock and applied after it is released.
#[derive(Default)]
struct Effects {
    coverage: Vec<(SeriesKey, CoverageRange)>,
    events: Vec<SchedulerEvent>,
    feed_cancels: Vec<RequestId>,
    retries: Vec<(RequestId, Duration)>,
}

struct Inner {
    config: SchedulerConfig,
    feed: Arc<dyn BrokerFeed>,
    store: Arc<SeriesStore>,
    clock: Arc<dyn Clock>,
    ids: RequestIdAllocator,
    pacing: Option<ThrottlingQueue>,
    sink: FeedEventSink,
    state: Mutex<SchedulerState>,
    feed_events: Mutex<Option<mpsc::Receiver<FeedEvent>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SchedulerEvent>>>,
}

/// Shared handle to the scheduler; clones refer to the same queues.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl Debug for RequestScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("feed", &self.inner.feed.id())
            .field("max_concurrency", &self.inner.config.max_concurrency)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestScheduler {
    pub fn new(
        config: SchedulerConfig,
        feed: Arc<dyn BrokerFeed>,
        store: Arc<SeriesStore>,
        clock: Arc<dyn Clock>,
        ids: RequestIdAllocator,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        let pacing = config.pacing.as_ref().map(ThrottlingQueue::from_policy);
        let state = SchedulerState::new(config.retire_grace);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                feed,
                store,
                clock,
                ids,
                pacing,
                sink: FeedEventSink::new(tx),
                state: Mutex::new(state),
                feed_events: Mutex::new(Some(rx)),
                subscribers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Producer handle feeds deliver callbacks into.
    pub fn sink(&self) -> FeedEventSink {
        self.inner.sink.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn submit(&self, request: FetchRequest) -> RequestId {
        let id = request.id;
        self.inner
            .state
            .lock()
            .pending
            .push(Prioritized(Tracked::new(request, None)));
        self.dispatch();
        id
    }

    /// Register `requests` as one group. An empty group completes immediately.
    pub fn submit_group(&self, requests: Vec<FetchRequest>) -> GroupId {
        let group = self.inner.ids.next_group();
        let empty = requests.is_empty();
        if !empty {
            let mut state = self.inner.state.lock();
            state.groups.insert(
                group,
                GroupState {
                    outstanding: requests.iter().map(|request| request.id).collect(),
                    ..GroupState::default()
                },
            );
            for request in requests {
                state
                    .pending
                    .push(Prioritized(Tracked::new(request, Some(group))));
            }
        }

        debug!(group = %group, empty, "submitted request group");
        if empty {
            self.emit(vec![SchedulerEvent::GroupCompleted {
                group,
                failed: 0,
                cancelled: 0,
            }]);
        } else {
            self.dispatch();
        }
        group
    }

    /// Move pending requests in flight until the cap or the pacing budget is reached.
    pub fn dispatch(&self) {
        let cap = self.inner.config.max_concurrency;
        let mut submissions = Vec::new();
        let mut rearm = None;
        {
            let mut state = self.inner.state.lock();
            while state.in_flight.len() < cap {
                let Some(Prioritized(mut tracked)) = state.pending.pop() else {
                    break;
                };
                if let Some(pacing) = &self.inner.pacing {
                    if let Err(wait) = pacing.acquire() {
                        state.pending.push(Prioritized(tracked));
                        if !state.dispatch_armed {
                            state.dispatch_armed = true;
                            rearm = Some(wait);
                        }
                        break;
                    }
                }

                let now = Instant::now();
                tracked.last_activity = Some(now);
                let id = tracked.request.id;
                submissions.push(FeedRequest::from(&tracked.request));
                state.dispatched_at.insert(id, now);
                state.in_flight.insert(id, tracked);
            }

            if state.in_flight.len() > cap {
                error!(
                    in_flight = state.in_flight.len(),
                    cap, "ConcurrencyCapExceeded: in-flight requests above cap"
                );
                debug_assert!(state.in_flight.len() <= cap, "in-flight requests above cap");
            }
        }

        if let Some(wait) = rearm {
            debug!(wait_ms = wait.as_millis() as u64, "pacing budget spent, deferring dispatch");
            self.schedule_dispatch(wait);
        }

        for request in submissions {
            debug!(
                id = %request.id,
                key = %request.key(),
                end = %request.end,
                keep_alive = request.keep_up_to_date,
                "dispatching request"
            );
            if let Err(error) = self.inner.feed.submit(&request, self.inner.sink.clone()) {
                self.on_error(request.id, error);
            }
        }
    }

    /// Apply one feed callback.
    pub fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Bars { id, bars } => self.on_bars(id, bars),
            FeedEvent::Completed { last, id, .. } => self.on_completed(id, last),
            FeedEvent::Error { id, error } => self.on_error(id, error),
        }
    }

    /// Apply every queued feed callback on the calling thread.
    ///
    /// Returns the number of events handled. Does nothing once [`RequestScheduler::start`]
    /// has taken the queue.
    pub fn drain_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let batch: Vec<FeedEvent> = {
                let mut guard = self.inner.feed_events.lock();
                let Some(rx) = guard.as_mut() else {
                    return handled;
                };
                std::iter::from_fn(|| rx.try_recv().ok()).collect()
            };
            if batch.is_empty() {
                return handled;
            }
            handled += batch.len();
            for event in batch {
                self.handle_event(event);
            }
        }
    }

    /// Spawn the event pump on the current tokio runtime.
    pub fn start(&self) -> Result<JoinHandle<()>, SyncError> {
        let mut rx = self
            .inner
            .feed_events
            .lock()
            .take()
            .ok_or(SyncError::AlreadyStarted)?;
        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                scheduler.handle_event(event);
            }
        }))
    }

    /// Drop the owner's pending requests and cancel its dispatched ones.
    pub fn cancel_owner(&self, owner: OwnerId) -> Vec<RequestId> {
        self.cancel_where(|request| request.owner == owner)
    }

    pub fn cancel_request(&self, id: RequestId) -> bool {
        !self.cancel_where(|request| request.id == id).is_empty()
    }

    /// Cancel `id` and queue the same work under a fresh id, keeping its group.
    ///
    /// Streams resume from the end of what is already covered.
    pub fn restart(&self, id: RequestId) -> Option<RequestId> {
        let fresh = self.inner.ids.next_request();
        {
            let mut state = self.inner.state.lock();
            let (tracked, _) = state.take_active(id)?;
            state.retire(id);
            state.replace_member(tracked.group, id, fresh);
            let request = FetchRequest {
                id: fresh,
                kind: RequestKind::Retry,
                range: self.resume_range(&tracked.request),
                ..tracked.request
            };
            info!(old = %id, new = %fresh, key = %request.key, "restarting request");
            state.pending.push(Prioritized(Tracked {
                request,
                bars: 0,
                last_activity: None,
                ..tracked
            }));
        }
        self.inner.feed.cancel(id);
        self.dispatch();
        Some(fresh)
    }

    /// One-shot requests dispatched longer than `timeout` ago without a terminal callback.
    pub fn expired(&self, timeout: Duration) -> Vec<RequestId> {
        let mut state = self.inner.state.lock();
        state.purge_retired();
        let mut ids: Vec<_> = state
            .in_flight
            .values()
            .filter(|tracked| !tracked.request.keep_alive)
            .filter_map(|tracked| {
                let id = tracked.request.id;
                let dispatched = state.dispatched_at.get(&id)?;
                (dispatched.elapsed() >= timeout).then_some(id)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Keep-alive requests with no callback for `threshold`.
    pub fn stale_streams(&self, threshold: Duration) -> Vec<RequestId> {
        let state = self.inner.state.lock();
        let mut ids: Vec<_> = state
            .streaming
            .values()
            .chain(state.in_flight.values().filter(|tracked| tracked.request.keep_alive))
            .filter(|tracked| {
                tracked
                    .last_activity
                    .is_some_and(|last| last.elapsed() >= threshold)
            })
            .map(|tracked| tracked.request.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn state_of(&self, id: RequestId) -> Option<RequestState> {
        let mut state = self.inner.state.lock();
        state.purge_retired();
        state.state_of(id)
    }

    /// Pending requests in dispatch order.
    pub fn pending_requests(&self) -> Vec<FetchRequest> {
        let state = self.inner.state.lock();
        let mut entries: Vec<&Prioritized> = state.pending.iter().collect();
        entries.sort_by(|left, right| right.cmp(left));
        entries.into_iter().map(|entry| entry.0.request.clone()).collect()
    }

    pub fn in_flight_requests(&self) -> Vec<FetchRequest> {
        let state = self.inner.state.lock();
        let mut requests: Vec<_> = state
            .in_flight
            .values()
            .map(|tracked| tracked.request.clone())
            .collect();
        requests.sort_by_key(|request| request.id);
        requests
    }

    pub fn streaming_requests(&self) -> Vec<FetchRequest> {
        let state = self.inner.state.lock();
        let mut requests: Vec<_> = state
            .streaming
            .values()
            .map(|tracked| tracked.request.clone())
            .collect();
        requests.sort_by_key(|request| request.id);
        requests
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut state = self.inner.state.lock();
        state.purge_retired();
        SchedulerStats {
            pending: state.pending.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            streaming: state.streaming.len(),
            retired: state.retired.len(),
            groups: state.groups.len(),
        }
    }

    fn on_bars(&self, id: RequestId, bars: Vec<Bar>) {
        let now = Instant::now();
        let (key, stream_start) = {
            let mut state = self.inner.state.lock();
            if let Some(tracked) = state.in_flight.get_mut(&id) {
                tracked.last_activity = Some(now);
                tracked.bars += bars.len();
                (tracked.request.key.clone(), None)
            } else if let Some(tracked) = state.streaming.get_mut(&id) {
                tracked.last_activity = Some(now);
                tracked.bars += bars.len();
                (tracked.request.key.clone(), Some(tracked.request.range.start()))
            } else {
                self.drop_late(&mut state, id, "bars");
                return;
            }
        };

        // A live stream is complete up to its newest (still-forming) bar.
        let coverage = stream_start.and_then(|start| {
            let forming = bars.iter().map(|bar| bar.ts).max()?;
            self.stream_coverage(&key, start, forming)
        });
        self.inner.store.merge_new_data(&key, bars, coverage);
    }

    fn on_completed(&self, id: RequestId, last: Option<UtcDateTime>) {
        let mut effects = Effects::default();
        {
            let mut state = self.inner.state.lock();
            let Some(mut tracked) = state.in_flight.remove(&id) else {
                if !state.streaming.contains_key(&id) {
                    self.drop_late(&mut state, id, "completion");
                }
                return;
            };
            let key = tracked.request.key.clone();
            let group = tracked.group;

            if tracked.request.keep_alive {
                let now = self.inner.clock.now();
                let forming = last.unwrap_or(now);
                if let Some(range) = self.stream_coverage(&key, tracked.request.range.start(), forming) {
                    effects.coverage.push((key.clone(), range));
                }
                tracked.last_activity = Some(Instant::now());
                state.dispatched_at.remove(&id);
                state.streaming.insert(id, tracked);
                info!(id = %id, key = %key, "stream started");
                effects.events.push(SchedulerEvent::StreamStarted { id, key });
            } else {
                if let Some(range) = self.settled_range(&tracked.request) {
                    effects.coverage.push((key.clone(), range));
                }
                state.retire(id);
                debug!(id = %id, key = %key, bars = tracked.bars, "request completed");
                effects.events.push(SchedulerEvent::RequestFinished {
                    id,
                    key,
                    kind: tracked.request.kind,
                    outcome: RequestOutcome::Completed { bars: tracked.bars },
                });
            }
            effects
                .events
                .extend(state.resolve(group, id, Resolution::Succeeded));
        }
        self.apply(effects);
        self.dispatch();
    }

    fn on_error(&self, id: RequestId, error: FeedError) {
        let mut effects = Effects::default();
        {
            let mut state = self.inner.state.lock();
            let Some((tracked, _)) = state.take_active(id) else {
                self.drop_late(&mut state, id, "error");
                return;
            };
            state.retire(id);
            let key = tracked.request.key.clone();
            let group = tracked.group;

            if error.kind() == FeedErrorKind::NoData {
                if let Some(range) = self.settled_range(&tracked.request) {
                    effects.coverage.push((key.clone(), range));
                }
                debug!(id = %id, key = %key, "no data for range, marking covered");
                effects.events.push(SchedulerEvent::RequestFinished {
                    id,
                    key,
                    kind: tracked.request.kind,
                    outcome: RequestOutcome::NoData,
                });
                effects
                    .events
                    .extend(state.resolve(group, id, Resolution::Succeeded));
            } else if let Some(delay) = self.inner.config.retry.next_delay(tracked.attempt, &error) {
                let fresh = self.inner.ids.next_request();
                warn!(
                    id = %id,
                    retry = %fresh,
                    key = %key,
                    attempt = tracked.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    code = error.code(),
                    "transient feed error, retrying"
                );
                state.replace_member(group, id, fresh);
                let request = FetchRequest {
                    id: fresh,
                    kind: RequestKind::Retry,
                    range: self.resume_range(&tracked.request),
                    ..tracked.request
                };
                state.delayed.insert(
                    fresh,
                    Tracked {
                        request,
                        group,
                        attempt: tracked.attempt + 1,
                        bars: 0,
                        last_activity: None,
                    },
                );
                effects.retries.push((fresh, delay));
            } else {
                warn!(id = %id, key = %key, code = error.code(), error = %error, "request failed");
                effects.events.push(SchedulerEvent::RequestFinished {
                    id,
                    key,
                    kind: tracked.request.kind,
                    outcome: RequestOutcome::Failed {
                        code: error.code(),
                        message: error.message().to_owned(),
                    },
                });
                effects
                    .events
                    .extend(state.resolve(group, id, Resolution::Failed));
            }
        }
        self.apply(effects);
        self.dispatch();
    }

    fn cancel_where(&self, predicate: impl Fn(&FetchRequest) -> bool) -> Vec<RequestId> {
        let mut effects = Effects::default();
        let mut cancelled = Vec::new();
        {
            let mut state = self.inner.state.lock();

            let (matching, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_vec()
                .into_iter()
                .partition(|entry| predicate(&entry.0.request));
            state.pending = BinaryHeap::from(kept);
            let mut removed: Vec<Tracked> = matching.into_iter().map(|entry| entry.0).collect();

            let delayed: Vec<_> = state
                .delayed
                .iter()
                .filter(|(_, tracked)| predicate(&tracked.request))
                .map(|(id, _)| *id)
                .collect();
            removed.extend(delayed.iter().filter_map(|id| state.delayed.remove(id)));

            let active: Vec<_> = state
                .in_flight
                .values()
                .chain(state.streaming.values())
                .filter(|tracked| predicate(&tracked.request))
                .map(|tracked| tracked.request.id)
                .collect();
            for id in active {
                if let Some((tracked, _)) = state.take_active(id) {
                    effects.feed_cancels.push(id);
                    removed.push(tracked);
                }
            }

            for tracked in removed {
                let id = tracked.request.id;
                state.retire(id);
                cancelled.push(id);
                effects.events.push(SchedulerEvent::RequestFinished {
                    id,
                    key: tracked.request.key.clone(),
                    kind: tracked.request.kind,
                    outcome: RequestOutcome::Cancelled,
                });
                effects
                    .events
                    .extend(state.resolve(tracked.group, id, Resolution::Cancelled));
            }
        }

        cancelled.sort();
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled requests");
        }
        self.apply(effects);
        self.dispatch();
        cancelled
    }

    fn apply(&self, effects: Effects) {
        for (key, range) in effects.coverage {
            self.inner.store.merge_new_data(&key, Vec::new(), Some(range));
        }
        for id in effects.feed_cancels {
            self.inner.feed.cancel(id);
        }
        for (id, delay) in effects.retries {
            self.schedule_retry(id, delay);
        }
        self.emit(effects.events);
    }

    fn emit(&self, events: Vec<SchedulerEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.inner.subscribers.lock();
        for event in events {
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    fn schedule_retry(&self, id: RequestId, delay: Duration) {
        match Handle::try_current() {
            Ok(handle) => {
                let scheduler = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.release_delayed(id);
                });
            }
            Err(_) => self.release_delayed(id),
        }
    }

    fn release_delayed(&self, id: RequestId) {
        {
            let mut state = self.inner.state.lock();
            let Some(tracked) = state.delayed.remove(&id) else {
                return;
            };
            state.pending.push(Prioritized(tracked));
        }
        self.dispatch();
    }

    fn schedule_dispatch(&self, wait: Duration) {
        let Ok(handle) = Handle::try_current() else {
            self.inner.state.lock().dispatch_armed = false;
            return;
        };
        let scheduler = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            scheduler.inner.state.lock().dispatch_armed = false;
            scheduler.dispatch();
        });
    }

    fn drop_late(&self, state: &mut SchedulerState, id: RequestId, what: &'static str) {
        state.purge_retired();
        if state.retired.contains_key(&id) {
            debug!(id = %id, what, "dropping callback for retired request");
        } else {
            debug!(id = %id, what, "dropping callback for unknown request");
        }
    }

    /// Covered span of a live stream: from its start up to the forming bar.
    fn stream_coverage(
        &self,
        key: &SeriesKey,
        start: UtcDateTime,
        forming: UtcDateTime,
    ) -> Option<CoverageRange> {
        let now = self.inner.clock.now();
        let end = forming.min(now).floor_to(key.granularity.seconds());
        CoverageRange::non_empty(start, end)
    }

    /// Part of a finished one-shot request that can no longer change: its
    /// range up to the start of the bar still forming now.
    fn settled_range(&self, request: &FetchRequest) -> Option<CoverageRange> {
        let step = request.key.granularity.seconds();
        request.range.clip_end(self.inner.clock.now().floor_to(step))
    }

    /// Range to re-request: streams pick up where coverage ends.
    fn resume_range(&self, request: &FetchRequest) -> CoverageRange {
        if !request.keep_alive {
            return request.range;
        }
        let now = self.inner.clock.now();
        let step = request.key.granularity.seconds();
        self.inner
            .store
            .coverage(&request.key)
            .covering(request.range.start())
            .map(|covered| covered.end().floor_to(step))
            .and_then(|start| CoverageRange::non_empty(start, now.max(request.range.end())))
            .unwrap_or(request.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::SimulatedFeed;
    use crate::{Granularity, Symbol};

    const HOUR: i64 = 3_600;

    fn at(hour: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(1_704_067_200 + hour * HOUR).expect("timestamp")
    }

    fn fixture(cap: usize) -> (RequestScheduler, SimulatedFeed, Arc<SeriesStore>, RequestIdAllocator) {
        let feed = SimulatedFeed::manual();
        let store = Arc::new(SeriesStore::new(false));
        let ids = RequestIdAllocator::new();
        let scheduler = RequestScheduler::new(
            SchedulerConfig {
                max_concurrency: cap,
                ..SchedulerConfig::default()
            },
            Arc::new(feed.clone()),
            Arc::clone(&store),
            Arc::new(ManualClock::new(at(1_000))),
            ids.clone(),
        )
        .expect("scheduler");
        (scheduler, feed, store, ids)
    }

    fn request(
        ids: &RequestIdAllocator,
        granularity: Granularity,
        end_hour: i64,
        owner: OwnerId,
    ) -> FetchRequest {
        FetchRequest {
            id: ids.next_request(),
            kind: RequestKind::CatchUp,
            key: SeriesKey::new(Symbol::parse("AAPL").expect("symbol"), granularity),
            range: CoverageRange::new(at(end_hour - 1), at(end_hour)).expect("range"),
            owner,
            keep_alive: false,
        }
    }

    #[test]
    fn priority_prefers_finer_then_newest_then_lowest_id() {
        let (scheduler, _, _, ids) = fixture(1);
        let owner = OwnerId::new();
        let blocker = request(&ids, Granularity::OneDay, 10, owner);
        scheduler.submit(blocker);

        let coarse_new = request(&ids, Granularity::OneHour, 50, owner);
        let fine_old = request(&ids, Granularity::OneMinute, 10, owner);
        let fine_new = request(&ids, Granularity::OneMinute, 40, owner);
        let fine_new_twin = request(&ids, Granularity::OneMinute, 40, owner);
        for request in [&coarse_new, &fine_old, &fine_new_twin, &fine_new] {
            scheduler.submit(request.clone());
        }

        let order: Vec<_> = scheduler
            .pending_requests()
            .into_iter()
            .map(|request| request.id)
            .collect();
        assert_eq!(
            order,
            vec![fine_new.id, fine_new_twin.id, fine_old.id, coarse_new.id]
        );
    }

    #[test]
    fn completion_frees_slot_and_dispatches_next() {
        let (scheduler, feed, store, ids) = fixture(1);
        let owner = OwnerId::new();
        let first = request(&ids, Granularity::OneHour, 10, owner);
        let second = request(&ids, Granularity::OneHour, 5, owner);
        scheduler.submit(first.clone());
        scheduler.submit(second.clone());
        assert_eq!(scheduler.in_flight_count(), 1);

        feed.complete(first.id, None, None).expect("complete");
        scheduler.drain_events();

        assert_eq!(scheduler.state_of(first.id), Some(RequestState::Retired));
        assert_eq!(scheduler.state_of(second.id), Some(RequestState::InFlight));
        assert!(store.coverage(&first.key).contains(&first.range));
    }

    #[test]
    fn late_callbacks_for_retired_ids_are_ignored() {
        let (scheduler, feed, store, ids) = fixture(2);
        let owner = OwnerId::new();
        let req = request(&ids, Granularity::OneHour, 10, owner);
        scheduler.submit(req.clone());

        let sink = scheduler.sink();
        scheduler.cancel_owner(owner);
        assert_eq!(feed.cancelled(), vec![req.id]);

        let bar = Bar::new(at(9), 1.0, 1.0, 1.0, 1.0, 1).expect("bar");
        sink.try_send(FeedEvent::Bars {
            id: req.id,
            bars: vec![bar],
        })
        .expect("send");
        scheduler.drain_events();

        assert!(store.get(&req.key).bars.is_empty());
    }

    #[test]
    fn empty_group_completes_immediately() {
        let (scheduler, _, _, _) = fixture(2);
        let mut events = scheduler.subscribe();

        let group = scheduler.submit_group(Vec::new());

        assert_eq!(
            events.try_recv().expect("event"),
            SchedulerEvent::GroupCompleted {
                group,
                failed: 0,
                cancelled: 0
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(scheduler.stats().groups, 0);
    }

    #[test]
    fn immediate_submit_failure_is_treated_as_error() {
        let (scheduler, feed, _, ids) = fixture(2);
        feed.reject_submissions(Some(FeedError::rejected("contract not found")));
        let mut events = scheduler.subscribe();
        let req = request(&ids, Granularity::OneHour, 10, OwnerId::new());

        scheduler.submit(req.clone());

        assert_eq!(scheduler.in_flight_count(), 0);
        let event = events.try_recv().expect("event");
        assert!(matches!(
            event,
            SchedulerEvent::RequestFinished {
                outcome: RequestOutcome::Failed { code: "feed.rejected", .. },
                ..
            }
        ));
    }
}
