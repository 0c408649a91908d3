use std::env;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::{Granularity, ValidationError};

pub const ENV_MAX_CONCURRENCY: &str = "BARSYNC_MAX_CONCURRENCY";
pub const ENV_INACTIVITY_TIMEOUT_SECS: &str = "BARSYNC_INACTIVITY_TIMEOUT_SECS";
pub const ENV_STALE_STREAM_SECS: &str = "BARSYNC_STALE_STREAM_SECS";

/// Request-start budget: at most `limit` submissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub window: Duration,
    pub limit: u32,
}

impl PacingPolicy {
    /// Historical-data pacing common to retail brokerage APIs.
    pub fn historical_default() -> Self {
        Self {
            window: Duration::from_secs(600),
            limit: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum requests in flight at the feed at once.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    /// How long a finished request id is remembered so late callbacks can be dropped.
    pub retire_grace: Duration,
    /// Capacity of the bounded feed-event queue.
    pub event_queue_capacity: usize,
    pub pacing: Option<PacingPolicy>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 6,
            retry: RetryConfig::default(),
            retire_grace: Duration::from_secs(5),
            event_queue_capacity: 4_096,
            pacing: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_concurrency == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "max_concurrency",
            });
        }
        if self.event_queue_capacity == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "event_queue_capacity",
            });
        }
        if self.pacing.is_some_and(|pacing| pacing.limit == 0) {
            return Err(ValidationError::ZeroConfigValue {
                field: "pacing.limit",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    /// Keep-alive gaps longer than this are split into a coarse backfill plus a fine tail.
    pub keep_alive_gap_threshold: Duration,
    pub backfill_granularity: Granularity,
    /// One-shot requests without a terminal callback for this long are restarted.
    pub inactivity_timeout: Duration,
    /// Streams without an update for this long are cancelled and re-issued.
    pub stale_stream_threshold: Duration,
    pub maintenance_interval: Duration,
    pub propagate: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            keep_alive_gap_threshold: Duration::from_secs(3 * 3_600),
            backfill_granularity: Granularity::FiveMinutes,
            inactivity_timeout: Duration::from_secs(60),
            stale_stream_threshold: Duration::from_secs(180),
            maintenance_interval: Duration::from_secs(5),
            propagate: true,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `BARSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ValidationError> {
        let mut config = Self::default();
        if let Some(value) = read_env_u64(ENV_MAX_CONCURRENCY)? {
            config.scheduler.max_concurrency = usize::try_from(value).unwrap_or(usize::MAX);
        }
        if let Some(value) = read_env_u64(ENV_INACTIVITY_TIMEOUT_SECS)? {
            config.inactivity_timeout = Duration::from_secs(value);
        }
        if let Some(value) = read_env_u64(ENV_STALE_STREAM_SECS)? {
            config.stale_stream_threshold = Duration::from_secs(value);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.scheduler.validate()?;
        if self.inactivity_timeout.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "inactivity_timeout",
            });
        }
        if self.stale_stream_threshold.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "stale_stream_threshold",
            });
        }
        Ok(())
    }

    pub fn gap_threshold_seconds(&self) -> i64 {
        i64::try_from(self.keep_alive_gap_threshold.as_secs()).unwrap_or(i64::MAX)
    }
}

fn read_env_u64(name: &'static str) -> Result<Option<u64>, ValidationError> {
    let Some(raw) = env::var_os(name) else {
        return Ok(None);
    };
    let raw = raw.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ValidationError::InvalidConfigValue {
            field: name,
            value: trimmed.to_owned(),
        })
}
