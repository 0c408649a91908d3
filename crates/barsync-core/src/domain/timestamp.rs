use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::ValidationError;

/// UTC instant at whole-second resolution, the grid every bar boundary sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    /// Wall clock truncated to the second.
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self(now.replace_nanosecond(0).unwrap_or(now))
    }

    /// Parse an RFC3339 instant with a `Z` or `+00:00` offset. Fractional
    /// seconds are dropped.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let not_utc = || ValidationError::TimestampNotUtc {
            value: input.to_owned(),
        };
        let parsed = OffsetDateTime::parse(input.trim(), &Rfc3339).map_err(|_| not_utc())?;
        if parsed.offset() != UtcOffset::UTC {
            return Err(not_utc());
        }
        parsed
            .replace_nanosecond(0)
            .map(Self)
            .map_err(|_| not_utc())
    }

    pub fn from_unix_timestamp(seconds: i64) -> Result<Self, ValidationError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self)
            .map_err(|_| ValidationError::TimestampOutOfRange { seconds })
    }

    pub fn unix_timestamp(self) -> i64 {
        self.0.unix_timestamp()
    }

    /// Shift by a signed number of seconds. Out-of-range results leave the value unchanged.
    pub fn add_seconds(self, seconds: i64) -> Self {
        self.0
            .checked_add(time::Duration::seconds(seconds))
            .map(Self)
            .unwrap_or(self)
    }

    /// Whole seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub fn seconds_since(self, earlier: Self) -> i64 {
        self.unix_timestamp() - earlier.unix_timestamp()
    }

    /// Floor to a multiple of `step_seconds` since the Unix epoch.
    pub fn floor_to(self, step_seconds: i64) -> Self {
        let seconds = self.unix_timestamp();
        let floored = seconds - seconds.rem_euclid(step_seconds.max(1));
        Self::from_unix_timestamp(floored).unwrap_or(self)
    }

    /// Ceil to a multiple of `step_seconds` since the Unix epoch.
    pub fn ceil_to(self, step_seconds: i64) -> Self {
        let floored = self.floor_to(step_seconds);
        if floored == self {
            floored
        } else {
            floored.add_seconds(step_seconds.max(1))
        }
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| format!("@{}", self.unix_timestamp()))
    }
}

impl Display for UtcDateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}
