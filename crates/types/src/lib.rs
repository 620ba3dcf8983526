use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Timelike, Utc};

/// Errors that can occur when parsing temporal values.
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// The input was not an RFC 3339 timestamp (or, where permitted, a bare date)
    #[error("Invalid timestamp '{0}'")]
    Invalid(String),
}

/// A UTC instant held in canonical form: RFC 3339, millisecond precision.
///
/// This type wraps a `chrono::DateTime<Utc>` and guarantees that construction
/// normalises any offset to UTC and truncates to whole milliseconds. Every
/// `Timestamp` therefore renders as a fixed-width string
/// (`2020-01-30T13:05:26.190Z`), and the rendered form compares
/// lexicographically in chronological order. The storage layer depends on
/// this: timestamps are persisted as text and compared with plain `<`/`>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` for the current instant.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Creates a `Timestamp` from a `DateTime`, truncating to milliseconds.
    pub fn from_datetime<Tz: TimeZone>(value: DateTime<Tz>) -> Self {
        let utc = value.with_timezone(&Utc);
        let millis = utc.nanosecond() / 1_000_000 * 1_000_000;
        Self(utc.with_nanosecond(millis).unwrap_or(utc))
    }

    /// Parses an RFC 3339 timestamp.
    ///
    /// Offsets are accepted and normalised to UTC; precision beyond
    /// milliseconds is truncated.
    ///
    /// # Arguments
    ///
    /// * `input` - The timestamp text, e.g. `2020-01-30T13:05:26.190+01:00`
    ///
    /// # Returns
    ///
    /// Returns `Ok(Timestamp)` on success, or `Err(TimestampError::Invalid)`
    /// if the input is not valid RFC 3339.
    pub fn parse(input: &str) -> Result<Self, TimestampError> {
        DateTime::parse_from_rfc3339(input)
            .map(Self::from_datetime)
            .map_err(|_| TimestampError::Invalid(input.to_owned()))
    }

    /// Parses an RFC 3339 timestamp or a bare `YYYY-MM-DD` date.
    ///
    /// Bare dates resolve to midnight UTC. Used for query parameters such as
    /// `modified_since` and `open_as_of`, where callers commonly supply a
    /// whole day.
    pub fn parse_lenient(input: &str) -> Result<Self, TimestampError> {
        if let Ok(ts) = Self::parse(input) {
            return Ok(ts);
        }
        NaiveDate::parse_from_str(input, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Self::from_datetime(Utc.from_utc_datetime(&naive)))
            .ok_or_else(|| TimestampError::Invalid(input.to_owned()))
    }

    /// Returns the wrapped `DateTime<Utc>`.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Renders the canonical millisecond RFC 3339 form with a `Z` suffix.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl std::str::FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self::from_datetime(value)
    }
}

impl serde::Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}
