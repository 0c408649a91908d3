//! Brokerage feed capability.
//!
//! A [`BrokerFeed`] accepts requests without blocking and reports progress
//! asynchronously through a [`FeedEventSink`]. Sinks wrap a bounded queue;
//! feed worker threads only enqueue, the scheduler pump does the rest.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::planner::{FetchRequest, RequestId};
use crate::{Bar, CoverageRange, Granularity, SeriesKey, Symbol, UtcDateTime};

/// Identifier of a feed implementation.
pub type FeedId = &'static str;

/// Wire-neutral request handed to a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub id: RequestId,
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub end: UtcDateTime,
    pub duration_seconds: i64,
    pub keep_up_to_date: bool,
}

impl FeedRequest {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.granularity)
    }

    pub fn start(&self) -> UtcDateTime {
        self.end.add_seconds(-self.duration_seconds)
    }
}

impl From<&FetchRequest> for FeedRequest {
    fn from(request: &FetchRequest) -> Self {
        Self {
            id: request.id,
            symbol: request.key.symbol.clone(),
            granularity: request.key.granularity,
            end: request.range.end(),
            duration_seconds: request.range.seconds(),
            keep_up_to_date: request.keep_alive,
        }
    }
}

/// Callback delivered by a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Bars {
        id: RequestId,
        bars: Vec<Bar>,
    },
    Completed {
        id: RequestId,
        first: Option<UtcDateTime>,
        last: Option<UtcDateTime>,
    },
    Error {
        id: RequestId,
        error: FeedError,
    },
}

impl FeedEvent {
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::Bars { id, .. } | Self::Completed { id, .. } | Self::Error { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedErrorKind {
    /// Connectivity or pacing hiccup; worth retrying.
    Transient,
    /// The feed has nothing for the requested range.
    NoData,
    /// The feed refused the request outright.
    Rejected,
    Internal,
}

/// Structured feed error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    kind: FeedErrorKind,
    message: String,
}

impl FeedError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FeedErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self {
            kind: FeedErrorKind::NoData,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FeedErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FeedErrorKind::Internal,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> FeedErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        matches!(self.kind, FeedErrorKind::Transient)
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FeedErrorKind::Transient => "feed.transient",
            FeedErrorKind::NoData => "feed.no_data",
            FeedErrorKind::Rejected => "feed.rejected",
            FeedErrorKind::Internal => "feed.internal",
        }
    }
}

impl Display for FeedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for FeedError {}

/// Producer half of the scheduler's bounded feed-event queue.
#[derive(Debug, Clone)]
pub struct FeedEventSink {
    tx: mpsc::Sender<FeedEvent>,
}

impl FeedEventSink {
    pub fn new(tx: mpsc::Sender<FeedEvent>) -> Self {
        Self { tx }
    }

    /// Enqueue without waiting. Safe to call from any thread.
    pub fn try_send(&self, event: FeedEvent) -> Result<(), FeedError> {
        self.tx.try_send(event).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => FeedError::transient("feed event queue is full"),
            mpsc::error::TrySendError::Closed(_) => {
                FeedError::internal("feed event queue is closed")
            }
        })
    }

    /// Enqueue, waiting for capacity.
    pub async fn send(&self, event: FeedEvent) -> Result<(), FeedError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| FeedError::internal("feed event queue is closed"))
    }
}

/// Consumed brokerage capability. One implementation per vendor.
pub trait BrokerFeed: Send + Sync {
    fn id(&self) -> FeedId;

    /// Start a request. Must return promptly; progress arrives through `sink`.
    fn submit(&self, request: &FeedRequest, sink: FeedEventSink) -> Result<(), FeedError>;

    /// Ask the feed to stop a request. Callbacks may still arrive afterwards.
    fn cancel(&self, id: RequestId);
}

/// In-process feed that records traffic and can answer with synthetic bars.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFeed {
    state: Arc<Mutex<SimulatedState>>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    auto_respond: bool,
    submitted: Vec<FeedRequest>,
    cancelled: Vec<RequestId>,
    sinks: HashMap<RequestId, FeedEventSink>,
    scripted: Vec<(SeriesKey, CoverageRange, FeedError)>,
    reject_submit: Option<FeedError>,
}

impl SimulatedFeed {
    /// Feed that records submissions and waits for the caller to respond.
    pub fn manual() -> Self {
        Self::default()
    }

    /// Feed that immediately streams synthetic bars and completes each request.
    pub fn auto_respond() -> Self {
        let feed = Self::default();
        feed.state.lock().auto_respond = true;
        feed
    }

    /// Answer the request for exactly `(key, range)` with `error` when auto-responding.
    pub fn script_error(&self, key: SeriesKey, range: CoverageRange, error: FeedError) {
        self.state.lock().scripted.push((key, range, error));
    }

    /// Fail every following `submit` call synchronously.
    pub fn reject_submissions(&self, error: Option<FeedError>) {
        self.state.lock().reject_submit = error;
    }

    pub fn submitted(&self) -> Vec<FeedRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<RequestId> {
        self.state.lock().cancelled.clone()
    }

    pub fn push_bars(&self, id: RequestId, bars: Vec<Bar>) -> Result<(), FeedError> {
        self.deliver(FeedEvent::Bars { id, bars })
    }

    pub fn complete(
        &self,
        id: RequestId,
        first: Option<UtcDateTime>,
        last: Option<UtcDateTime>,
    ) -> Result<(), FeedError> {
        self.deliver(FeedEvent::Completed { id, first, last })
    }

    pub fn fail(&self, id: RequestId, error: FeedError) -> Result<(), FeedError> {
        self.deliver(FeedEvent::Error { id, error })
    }

    fn deliver(&self, event: FeedEvent) -> Result<(), FeedError> {
        let sink = self
            .state
            .lock()
            .sinks
            .get(&event.request_id())
            .cloned()
            .ok_or_else(|| FeedError::rejected(format!("unknown request {}", event.request_id())))?;
        sink.try_send(event)
    }
}

impl BrokerFeed for SimulatedFeed {
    fn id(&self) -> FeedId {
        "simulated"
    }

    fn submit(&self, request: &FeedRequest, sink: FeedEventSink) -> Result<(), FeedError> {
        let (auto_respond, scripted) = {
            let mut state = self.state.lock();
            if let Some(error) = state.reject_submit.clone() {
                return Err(error);
            }
            state.submitted.push(request.clone());
            state.sinks.insert(request.id, sink.clone());
            let key = request.key();
            let scripted = state
                .scripted
                .iter()
                .find(|(scripted_key, range, _)| {
                    *scripted_key == key
                        && range.start() == request.start()
                        && range.end() == request.end
                })
                .map(|(_, _, error)| error.clone());
            (state.auto_respond, scripted)
        };

        if !auto_respond {
            return Ok(());
        }
        if let Some(error) = scripted {
            return sink.try_send(FeedEvent::Error {
                id: request.id,
                error,
            });
        }

        let bars = synthetic_bars(request);
        let first = bars.first().map(|bar| bar.ts);
        let last = bars.last().map(|bar| bar.ts);
        if !bars.is_empty() {
            sink.try_send(FeedEvent::Bars {
                id: request.id,
                bars,
            })?;
        }
        sink.try_send(FeedEvent::Completed {
            id: request.id,
            first,
            last,
        })
    }

    fn cancel(&self, id: RequestId) {
        let mut state = self.state.lock();
        state.cancelled.push(id);
        state.sinks.remove(&id);
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic random-walk bars for every boundary inside the request window.
pub fn synthetic_bars(request: &FeedRequest) -> Vec<Bar> {
    let step = request.granularity.seconds();
    let seed = fnv1a(request.symbol.as_str());
    // Share classes and contracts of one issuer trade around the same level.
    let base = 50.0 + (fnv1a(request.symbol.root()) % 200) as f64;

    let mut bars = Vec::new();
    let mut ts = request.start().ceil_to(step);
    while ts < request.end {
        let mut rng = fastrand::Rng::with_seed(seed ^ ts.unix_timestamp() as u64);
        let open = base + rng.f64() * 10.0;
        let close = base + rng.f64() * 10.0;
        let high = open.max(close) + rng.f64();
        let low = (open.min(close) - rng.f64()).max(0.0);
        let volume = rng.u64(100..10_000);
        if let Ok(bar) = Bar::new(ts, open, high, low, close, volume) {
            bars.push(bar);
        }
        ts = ts.add_seconds(step);
    }
    bars
}
