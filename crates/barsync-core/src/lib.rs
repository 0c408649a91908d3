//! Core engine for barsync.
//!
//! This crate contains:
//! - Canonical bar, granularity and coverage types with validation
//! - Per-key series buffers with fine→coarse propagation
//! - Fetch planning, concurrency-capped request scheduling and live sync
//! - The brokerage feed capability and a simulated feed
//! - Persistence of buffers to the DuckDB warehouse

pub mod clock;
pub mod config;
pub mod coverage;
pub mod domain;
pub mod error;
pub mod feed;
pub mod persistence;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod throttling;

pub use barsync_warehouse::{Warehouse, WarehouseConfig, WarehouseError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PacingPolicy, SchedulerConfig, SyncConfig};
pub use coverage::CoverageSet;
pub use domain::{Bar, CoverageRange, Granularity, SeriesKey, Symbol, UtcDateTime};
pub use error::{SyncError, ValidationError};
pub use feed::{
    BrokerFeed, FeedError, FeedErrorKind, FeedEvent, FeedEventSink, FeedRequest, SimulatedFeed,
};
pub use persistence::{InMemoryPersistence, SeriesPersistence};
pub use planner::{
    FetchPlanner, FetchRequest, GroupId, OwnerId, RequestId, RequestIdAllocator, RequestKind,
};
pub use retry::{Backoff, RetryConfig};
pub use scheduler::{
    RequestOutcome, RequestScheduler, RequestState, SchedulerEvent, SchedulerStats,
};
pub use store::{ChangeEvent, MergeOutcome, SeriesSnapshot, SeriesStore};
pub use sync::{MaintenanceReport, SyncCoordinator, SyncStatus};
pub use throttling::ThrottlingQueue;
