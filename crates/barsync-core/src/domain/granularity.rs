use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Supported bar window sizes.
///
/// Variants are declared finest first, so the derived `Ord` sorts finer
/// granularities before coarser ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "2m")]
    TwoMinutes,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Granularity {
    pub const ALL: [Self; 9] = [
        Self::OneMinute,
        Self::TwoMinutes,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::TwoMinutes => "2m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    /// Bar window length in seconds.
    pub const fn seconds(self) -> i64 {
        match self {
            Self::OneMinute => MINUTE,
            Self::TwoMinutes => 2 * MINUTE,
            Self::ThreeMinutes => 3 * MINUTE,
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::ThirtyMinutes => 30 * MINUTE,
            Self::OneHour => HOUR,
            Self::FourHours => 4 * HOUR,
            Self::OneDay => DAY,
        }
    }

    /// The finer granularity this one is aggregated from, if any.
    ///
    /// `1m` and `1d` are only ever fetched from the feed.
    pub const fn derived_from(self) -> Option<Self> {
        match self {
            Self::OneMinute | Self::OneDay => None,
            Self::TwoMinutes | Self::ThreeMinutes | Self::FiveMinutes => Some(Self::OneMinute),
            Self::FifteenMinutes | Self::ThirtyMinutes => Some(Self::FiveMinutes),
            Self::OneHour => Some(Self::FifteenMinutes),
            Self::FourHours => Some(Self::OneHour),
        }
    }

    /// Granularities directly derived from this one.
    pub fn derivatives(self) -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(move |candidate| candidate.derived_from() == Some(self))
    }

    /// History requested when a series is refetched from scratch.
    pub const fn lookback_seconds(self) -> i64 {
        match self {
            Self::OneMinute => 2 * DAY,
            Self::TwoMinutes | Self::ThreeMinutes => 4 * DAY,
            Self::FiveMinutes => 7 * DAY,
            Self::FifteenMinutes | Self::ThirtyMinutes => 14 * DAY,
            Self::OneHour => 60 * DAY,
            Self::FourHours => 180 * DAY,
            Self::OneDay => 730 * DAY,
        }
    }

    /// Largest span a single feed request may cover.
    pub const fn max_request_seconds(self) -> i64 {
        match self {
            Self::OneMinute => DAY,
            Self::TwoMinutes | Self::ThreeMinutes => 2 * DAY,
            Self::FiveMinutes => WEEK,
            Self::FifteenMinutes | Self::ThirtyMinutes => 2 * WEEK,
            Self::OneHour => 4 * WEEK,
            Self::FourHours => 13 * WEEK,
            Self::OneDay => 52 * WEEK,
        }
    }

    pub fn is_finer_than(self, other: Self) -> bool {
        self.seconds() < other.seconds()
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Self::OneMinute),
            "2m" => Ok(Self::TwoMinutes),
            "3m" => Ok(Self::ThreeMinutes),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "4h" => Ok(Self::FourHours),
            "1d" => Ok(Self::OneDay),
            other => Err(ValidationError::InvalidGranularity {
                value: other.to_owned(),
            }),
        }
    }
}
