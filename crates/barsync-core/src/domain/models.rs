use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{Granularity, Symbol, UtcDateTime, ValidationError};

/// OHLCV aggregate over one granularity window starting at `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    pub fn new(
        ts: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Result<Self, ValidationError> {
        validate_non_negative("open", open)?;
        validate_non_negative("high", high)?;
        validate_non_negative("low", low)?;
        validate_non_negative("close", close)?;

        if high < low {
            return Err(ValidationError::InvalidBarRange);
        }

        if open < low || open > high || close < low || close > high {
            return Err(ValidationError::InvalidBarBounds);
        }

        Ok(Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Cheap structural check used to drop garbage from feed batches.
    pub fn is_well_formed(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|value| value.is_finite() && *value >= 0.0)
            && self.high >= self.low
    }

    /// Fold a newer print of the same still-forming bar into this one.
    ///
    /// Returns `true` when any field changed.
    pub fn amend(&mut self, newer: &Bar) -> bool {
        let amended = Bar {
            ts: self.ts,
            open: self.open,
            high: self.high.max(newer.high),
            low: self.low.min(newer.low),
            close: newer.close,
            volume: self.volume.max(newer.volume),
        };
        if amended == *self {
            return false;
        }
        *self = amended;
        true
    }

    /// Aggregate consecutive finer bars into one bar stamped `ts`.
    ///
    /// `bars` must be in time order; returns `None` for an empty slice.
    pub fn aggregate(ts: UtcDateTime, bars: &[Bar]) -> Option<Bar> {
        let first = bars.first()?;
        let last = bars.last()?;
        let mut high = first.high;
        let mut low = first.low;
        let mut volume = 0u64;
        for bar in bars {
            high = high.max(bar.high);
            low = low.min(bar.low);
            volume = volume.saturating_add(bar.volume);
        }

        Some(Bar {
            ts,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
        })
    }
}

/// Primary cache key: one buffer per symbol and granularity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: Symbol,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(symbol: Symbol, granularity: Granularity) -> Self {
        Self {
            symbol,
            granularity,
        }
    }

    /// Parse `SYMBOL@granularity`, e.g. `AAPL@5m`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let (symbol, granularity) =
            input
                .rsplit_once('@')
                .ok_or_else(|| ValidationError::InvalidSeriesKey {
                    value: input.to_owned(),
                })?;
        Ok(Self::new(Symbol::parse(symbol)?, granularity.parse()?))
    }

    /// Same symbol at another granularity.
    pub fn with_granularity(&self, granularity: Granularity) -> Self {
        Self::new(self.symbol.clone(), granularity)
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.granularity)
    }
}

/// Half-open `[start, end)` span of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoverageRange {
    start: UtcDateTime,
    end: UtcDateTime,
}

impl CoverageRange {
    pub fn new(start: UtcDateTime, end: UtcDateTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptyRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Like [`CoverageRange::new`] but yields `None` for an empty span.
    pub fn non_empty(start: UtcDateTime, end: UtcDateTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub const fn start(&self) -> UtcDateTime {
        self.start
    }

    pub const fn end(&self) -> UtcDateTime {
        self.end
    }

    pub fn seconds(&self) -> i64 {
        self.end.seconds_since(self.start)
    }

    pub fn contains_instant(&self, ts: UtcDateTime) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn contains(&self, other: &CoverageRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Overlapping or touching (`end == start`) ranges.
    pub fn touches(&self, other: &CoverageRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersection(&self, other: &CoverageRange) -> Option<CoverageRange> {
        Self::non_empty(self.start.max(other.start), self.end.min(other.end))
    }

    /// Clip the end to `limit`; `None` when nothing remains.
    pub fn clip_end(&self, limit: UtcDateTime) -> Option<CoverageRange> {
        Self::non_empty(self.start, self.end.min(limit))
    }

    /// Shrink to the whole windows of `step_seconds` the range fully contains.
    pub fn align_inward(&self, step_seconds: i64) -> Option<CoverageRange> {
        Self::non_empty(self.start.ceil_to(step_seconds), self.end.floor_to(step_seconds))
    }
}

impl Display for CoverageRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}
