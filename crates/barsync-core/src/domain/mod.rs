//! # Domain Models
//!
//! Canonical domain types for barsync series buffers.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bar`] | OHLCV bar stamped at its window start |
//! | [`Granularity`] | Bar window size with derivation and fetch policy tables |
//! | [`SeriesKey`] | `(symbol, granularity)` cache key |
//! | [`CoverageRange`] | Half-open span known to be fully fetched |
//! | [`Symbol`] | Validated instrument reference |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! Construction validates invariants; feed data that bypasses the
//! constructors is screened again with [`Bar::is_well_formed`] before it
//! reaches a buffer.

mod granularity;
mod models;
mod symbol;
mod timestamp;

pub use granularity::Granularity;
pub use models::{Bar, CoverageRange, SeriesKey};
pub use symbol::Symbol;
pub use timestamp::UtcDateTime;
