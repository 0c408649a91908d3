use thiserror::Error;

use crate::feed::FeedError;
use crate::SeriesKey;

/// Validation and contract errors exposed by `barsync-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol must start with an ASCII letter: '{ch}'")]
    SymbolInvalidStart { ch: char },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("invalid granularity '{value}', expected one of 1m, 2m, 3m, 5m, 15m, 30m, 1h, 4h, 1d")]
    InvalidGranularity { value: String },
    #[error("series key must look like SYMBOL@granularity: '{value}'")]
    InvalidSeriesKey { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("unix timestamp {seconds} is out of range")]
    TimestampOutOfRange { seconds: i64 },
    #[error("range start {start} must be before end {end}")]
    EmptyRange { start: String, end: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,

    #[error("config value '{field}' must be greater than zero")]
    ZeroConfigValue { field: &'static str },
    #[error("config value '{field}' is invalid: '{value}'")]
    InvalidConfigValue { field: &'static str, value: String },
}

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("persistence error: {0}")]
    Persistence(#[from] barsync_warehouse::WarehouseError),

    #[error("no buffer exists for series '{0}'")]
    UnknownKey(SeriesKey),

    #[error("scheduler event loop is already running")]
    AlreadyStarted,
}
