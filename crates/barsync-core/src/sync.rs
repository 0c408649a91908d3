//! Consumer-facing synchronization.
//!
//! The coordinator multiplexes consumers onto one underlying fetch or stream
//! per [`SeriesKey`], sequences catch-up, backfill and live-tail phases
//! through scheduler groups, and keeps a status per key.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::feed::BrokerFeed;
use crate::planner::{FetchPlanner, FetchRequest, GroupId, OwnerId, RequestId, RequestIdAllocator};
use crate::scheduler::{RequestOutcome, RequestScheduler, SchedulerEvent};
use crate::store::{ChangeEvent, SeriesSnapshot, SeriesStore};
use crate::{CoverageRange, SeriesKey, UtcDateTime};

/// Per-key synchronization status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    CatchingUp,
    Backfilling,
    Streaming,
    Initialized,
    Failed { reason: String },
}

impl SyncStatus {
    fn is_active(&self) -> bool {
        matches!(self, Self::CatchingUp | Self::Backfilling | Self::Streaming)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// One-shot requests restarted after the inactivity timeout.
    pub restarted: Vec<RequestId>,
    /// Streams cancelled and re-issued for staleness.
    pub reissued: Vec<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CatchUp,
    Backfill,
    Tail,
}

#[derive(Debug)]
struct KeyState {
    /// Scheduler owner of every request issued for this key.
    owner: OwnerId,
    consumers: HashSet<OwnerId>,
    keep_alive: bool,
    streaming: bool,
    status: SyncStatus,
    group: Option<GroupId>,
    last_error: Option<String>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            owner: OwnerId::new(),
            consumers: HashSet::new(),
            keep_alive: false,
            streaming: false,
            status: SyncStatus::Idle,
            group: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    keys: HashMap<SeriesKey, KeyState>,
    groups: HashMap<GroupId, (SeriesKey, Phase)>,
    last_synced: HashMap<SeriesKey, UtcDateTime>,
}

struct CoordinatorInner {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    store: Arc<SeriesStore>,
    planner: FetchPlanner,
    scheduler: RequestScheduler,
    state: Mutex<CoordinatorState>,
    scheduler_events: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
}

/// Entry point for consumers: request, cancel, observe.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl Debug for SyncCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("keys", &self.inner.state.lock().keys.len())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        feed: Arc<dyn BrokerFeed>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let store = Arc::new(SeriesStore::new(config.propagate));
        Self::with_store(config, feed, clock, store)
    }

    /// Build around an existing (for example pre-seeded) store.
    pub fn with_store(
        config: SyncConfig,
        feed: Arc<dyn BrokerFeed>,
        clock: Arc<dyn Clock>,
        store: Arc<SeriesStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let ids = RequestIdAllocator::new();
        let planner = FetchPlanner::new(Arc::clone(&store), Arc::clone(&clock), ids.clone());
        let scheduler = RequestScheduler::new(
            config.scheduler.clone(),
            feed,
            Arc::clone(&store),
            Arc::clone(&clock),
            ids,
        )?;
        let scheduler_events = scheduler.subscribe();

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                clock,
                store,
                planner,
                scheduler,
                state: Mutex::new(CoordinatorState::default()),
                scheduler_events: Mutex::new(Some(scheduler_events)),
            }),
        })
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.inner.scheduler
    }

    pub fn planner(&self) -> &FetchPlanner {
        &self.inner.planner
    }

    pub fn get_buffer(&self, key: &SeriesKey) -> SeriesSnapshot {
        self.inner.store.get(key)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.store.subscribe()
    }

    pub fn status(&self, key: &SeriesKey) -> SyncStatus {
        self.inner
            .state
            .lock()
            .keys
            .get(key)
            .map_or(SyncStatus::Idle, |state| state.status.clone())
    }

    pub fn statuses(&self) -> Vec<(SeriesKey, SyncStatus)> {
        let state = self.inner.state.lock();
        let mut statuses: Vec<_> = state
            .keys
            .iter()
            .map(|(key, key_state)| (key.clone(), key_state.status.clone()))
            .collect();
        statuses.sort_by(|left, right| left.0.cmp(&right.0));
        statuses
    }

    pub fn last_synced(&self, key: &SeriesKey) -> Option<UtcDateTime> {
        self.inner.state.lock().last_synced.get(key).copied()
    }

    /// Record that `key` was in sync at `at`, e.g. when restoring persisted state.
    pub fn mark_synced(&self, key: &SeriesKey, at: UtcDateTime) {
        self.inner.state.lock().last_synced.insert(key.clone(), at);
    }

    /// Attach `owner` to each key, starting a fetch or stream where none is running.
    pub fn request_updates(&self, owner: OwnerId, keys: &[SeriesKey], keep_alive: bool) {
        for key in keys {
            let start = {
                let mut state = self.inner.state.lock();
                let key_state = state.keys.entry(key.clone()).or_insert_with(KeyState::new);
                key_state.consumers.insert(owner);
                key_state.keep_alive |= keep_alive;

                match &key_state.status {
                    status if status.is_active() => {
                        debug!(key = %key, owner = %owner, "attached to running sync");
                        None
                    }
                    SyncStatus::Initialized if !keep_alive => None,
                    _ => Some((key_state.owner, key_state.keep_alive)),
                }
            };

            if let Some((key_owner, live)) = start {
                if live {
                    self.start_live(key, key_owner);
                } else {
                    self.start_catch_up(key, key_owner);
                }
            }
        }
    }

    /// Detach `owner`; keys left without consumers have their requests torn down.
    pub fn cancel_updates(&self, owner: OwnerId) -> Vec<SeriesKey> {
        let released: Vec<(SeriesKey, OwnerId)> = {
            let mut state = self.inner.state.lock();
            let mut released = Vec::new();
            for (key, key_state) in &mut state.keys {
                if key_state.consumers.remove(&owner) && key_state.consumers.is_empty() {
                    released.push((key.clone(), key_state.owner));
                }
            }
            for (key, _) in &released {
                state.keys.remove(key);
                state.groups.retain(|_, (group_key, _)| group_key != key);
            }
            released
        };

        let mut keys = Vec::with_capacity(released.len());
        for (key, key_owner) in released {
            self.inner.scheduler.cancel_owner(key_owner);
            if let Some(end) = self.inner.store.coverage(&key).last_end() {
                self.inner.state.lock().last_synced.insert(key.clone(), end);
            }
            info!(key = %key, "last consumer detached, sync torn down");
            keys.push(key);
        }
        keys.sort();
        keys
    }

    /// Drop coverage for a tracked key and refetch its full lookback window.
    pub fn refetch(&self, key: &SeriesKey) -> Result<GroupId, SyncError> {
        let key_owner = {
            let state = self.inner.state.lock();
            state
                .keys
                .get(key)
                .map(|key_state| key_state.owner)
                .ok_or_else(|| SyncError::UnknownKey(key.clone()))?
        };
        let desired = self
            .inner
            .planner
            .lookback_window(key.granularity)
            .ok_or_else(|| SyncError::UnknownKey(key.clone()))?;
        let requests = self.inner.planner.plan(key, desired, true, key_owner, false);
        Ok(self.submit_phase(key, Phase::CatchUp, requests, SyncStatus::CatchingUp))
    }

    /// Restart timed-out one-shot requests and re-issue stale streams.
    pub fn maintain(&self) -> MaintenanceReport {
        let scheduler = &self.inner.scheduler;
        let mut report = MaintenanceReport::default();
        for id in scheduler.expired(self.inner.config.inactivity_timeout) {
            if let Some(fresh) = scheduler.restart(id) {
                warn!(id = %id, retry = %fresh, "request timed out, restarted");
                report.restarted.push(fresh);
            }
        }
        for id in scheduler.stale_streams(self.inner.config.stale_stream_threshold) {
            if let Some(fresh) = scheduler.restart(id) {
                warn!(id = %id, retry = %fresh, "stream went stale, re-issued");
                report.reissued.push(fresh);
            }
        }
        report
    }

    /// Apply queued scheduler events on the calling thread.
    pub fn pump_scheduler_events(&self) -> usize {
        let events: Vec<SchedulerEvent> = {
            let mut guard = self.inner.scheduler_events.lock();
            let Some(rx) = guard.as_mut() else {
                return 0;
            };
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let count = events.len();
        for event in events {
            self.handle_scheduler_event(event);
        }
        count
    }

    /// Drain feed callbacks and scheduler events until both queues are quiet.
    pub fn run_until_idle(&self) -> usize {
        let mut handled = 0;
        loop {
            let step = self.inner.scheduler.drain_events() + self.pump_scheduler_events();
            if step == 0 {
                return handled;
            }
            handled += step;
        }
    }

    /// Spawn the scheduler pump and the coordinator loop (events plus maintenance ticks).
    pub fn start(&self) -> Result<JoinHandle<()>, SyncError> {
        let mut events = self
            .inner
            .scheduler_events
            .lock()
            .take()
            .ok_or(SyncError::AlreadyStarted)?;
        let pump = self.inner.scheduler.start()?;
        let coordinator = self.clone();
        let interval = self.inner.config.maintenance_interval;

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => coordinator.handle_scheduler_event(event),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        coordinator.maintain();
                    }
                }
            }
            pump.abort();
        }))
    }

    fn handle_scheduler_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::GroupCompleted {
                group,
                failed,
                cancelled,
            } => self.on_group_completed(group, failed, cancelled),
            SchedulerEvent::StreamStarted { key, .. } => {
                let now = self.inner.clock.now();
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                if let Some(key_state) = state.keys.get_mut(&key) {
                    key_state.streaming = true;
                    key_state.status = SyncStatus::Streaming;
                    state.last_synced.insert(key, now);
                }
            }
            SchedulerEvent::RequestFinished {
                id,
                key,
                outcome: RequestOutcome::Failed { code, message },
                ..
            } => {
                let mut state = self.inner.state.lock();
                if let Some(key_state) = state.keys.get_mut(&key) {
                    let reason = format!("{message} ({code})");
                    if key_state.group.is_none() {
                        warn!(id = %id, key = %key, reason = %reason, "stream failed");
                        key_state.streaming = false;
                        key_state.status = SyncStatus::Failed {
                            reason: reason.clone(),
                        };
                    }
                    key_state.last_error = Some(reason);
                }
            }
            SchedulerEvent::RequestFinished { .. } => {}
        }
    }

    fn on_group_completed(&self, group: GroupId, failed: usize, cancelled: usize) {
        let now = self.inner.clock.now();
        let next = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some((key, phase)) = state.groups.remove(&group) else {
                return;
            };
            let Some(key_state) = state.keys.get_mut(&key) else {
                return;
            };
            if key_state.group == Some(group) {
                key_state.group = None;
            }

            if failed > 0 {
                let reason = key_state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("{failed} request(s) failed"));
                warn!(key = %key, group = %group, failed, "sync phase failed");
                key_state.status = SyncStatus::Failed { reason };
                return;
            }
            if cancelled > 0 {
                debug!(key = %key, group = %group, cancelled, "sync phase cancelled");
                return;
            }

            info!(key = %key, group = %group, phase = ?phase, "sync phase completed");
            match phase {
                Phase::CatchUp | Phase::Tail => {
                    let wants_tail = key_state.keep_alive && !key_state.streaming;
                    key_state.status = if key_state.streaming {
                        SyncStatus::Streaming
                    } else {
                        SyncStatus::Initialized
                    };
                    let key_owner = key_state.owner;
                    state.last_synced.insert(key.clone(), now);
                    (wants_tail && phase == Phase::CatchUp).then_some((key, key_owner, None))
                }
                Phase::Backfill => {
                    let since = now.add_seconds(-self.inner.config.gap_threshold_seconds());
                    Some((key.clone(), key_state.owner, Some(since)))
                }
            }
        };

        if let Some((key, key_owner, since)) = next {
            let since = since
                .or_else(|| self.inner.store.coverage(&key).last_end())
                .unwrap_or(now);
            self.start_tail(&key, key_owner, since);
        }
    }

    fn start_catch_up(&self, key: &SeriesKey, key_owner: OwnerId) {
        let Some(desired) = self.inner.planner.lookback_window(key.granularity) else {
            return;
        };
        let requests = self.inner.planner.plan(key, desired, false, key_owner, false);
        info!(key = %key, requests = requests.len(), "catch-up started");
        self.submit_phase(key, Phase::CatchUp, requests, SyncStatus::CatchingUp);
    }

    fn start_live(&self, key: &SeriesKey, key_owner: OwnerId) {
        let now = self.inner.clock.now();
        let last = self
            .last_synced(key)
            .or_else(|| self.inner.store.coverage(key).last_end());
        let threshold = self.inner.config.gap_threshold_seconds();
        let backfill = self.inner.config.backfill_granularity;

        let since = match last {
            Some(last) => last,
            None => match self.inner.planner.lookback_window(key.granularity) {
                Some(window) => window.start(),
                None => now,
            },
        };
        let gap = now.seconds_since(since);

        if gap > threshold && key.granularity.is_finer_than(backfill) {
            let backfill_key = key.with_granularity(backfill);
            let requests = CoverageRange::non_empty(since, now)
                .map(|range| self.inner.planner.plan_backfill(&backfill_key, range, key_owner))
                .unwrap_or_default();
            info!(
                key = %key,
                backfill = %backfill_key,
                gap_secs = gap,
                requests = requests.len(),
                "gap above threshold, backfilling before live tail"
            );
            self.submit_phase(key, Phase::Backfill, requests, SyncStatus::Backfilling);
            return;
        }

        if last.is_some() {
            self.start_tail(key, key_owner, since);
            return;
        }

        // Never synced: catch up the lookback window with the newest chunk kept alive.
        let mut requests = CoverageRange::non_empty(since, now)
            .map(|range| self.inner.planner.plan(key, range, false, key_owner, true))
            .unwrap_or_default();
        if !requests.iter().any(|request| request.keep_alive) {
            requests.extend(self.inner.planner.plan_tail(key, now, key_owner));
        }
        info!(key = %key, requests = requests.len(), "live catch-up started");
        self.submit_phase(key, Phase::CatchUp, requests, SyncStatus::CatchingUp);
    }

    fn start_tail(&self, key: &SeriesKey, key_owner: OwnerId, since: UtcDateTime) {
        let requests: Vec<FetchRequest> = self
            .inner
            .planner
            .plan_tail(key, since, key_owner)
            .into_iter()
            .collect();
        info!(key = %key, since = %since, "live tail started");
        let status = match self.status(key) {
            SyncStatus::Backfilling => SyncStatus::Backfilling,
            _ => SyncStatus::CatchingUp,
        };
        self.submit_phase(key, Phase::Tail, requests, status);
    }

    fn submit_phase(
        &self,
        key: &SeriesKey,
        phase: Phase,
        requests: Vec<FetchRequest>,
        status: SyncStatus,
    ) -> GroupId {
        let group = self.inner.scheduler.submit_group(requests);
        let mut state = self.inner.state.lock();
        state.groups.insert(group, (key.clone(), phase));
        if let Some(key_state) = state.keys.get_mut(key) {
            key_state.group = Some(group);
            key_state.last_error = None;
            if !(key_state.streaming && phase == Phase::CatchUp) {
                key_state.status = status;
            }
        }
        group
    }
}
