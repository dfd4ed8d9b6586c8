//! Lexicon timestamps

use std::cmp;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};
use smol_str::SmolStr;

use crate::error::TypeError;

static ISO8601_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2}(\.[0-9]+)?(Z|(\+[0-9]{2}|\-[0-9][1-9]):[0-9]{2})$",
    )
    .unwrap()
});

/// An ISO-8601 timestamp with microsecond precision.
///
/// The serialized form is preserved through parsing so values re-serialize
/// byte-identically, which matters anywhere the string ends up inside a
/// hashed encoding.
#[derive(Clone, Debug)]
pub struct Datetime {
    serialized: SmolStr,
    dt: chrono::DateTime<chrono::FixedOffset>,
}

impl Datetime {
    /// The current instant in UTC.
    pub fn now() -> Self {
        Self::new(chrono::Utc::now().fixed_offset())
    }

    /// Build from a chrono datetime, rounding to microsecond precision.
    pub fn new(dt: chrono::DateTime<chrono::FixedOffset>) -> Self {
        use chrono::DurationRound;
        let dt = dt
            .duration_round(chrono::Duration::microseconds(1))
            .expect("microsecond rounding does not overflow");
        let serialized = SmolStr::new(dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
        Self { serialized, dt }
    }

    /// The timestamp as its serialized string.
    pub fn as_str(&self) -> &str {
        self.serialized.as_str()
    }
}

impl PartialEq for Datetime {
    fn eq(&self, other: &Self) -> bool {
        self.dt == other.dt
    }
}

impl Eq for Datetime {}

impl Ord for Datetime {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.dt.cmp(&other.dt)
    }
}

impl PartialOrd for Datetime {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Datetime {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !ISO8601_REGEX.is_match(s) {
            return Err(TypeError::InvalidDatetime(s.to_string()));
        }
        let dt = chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|_| TypeError::InvalidDatetime(s.to_string()))?;
        Ok(Self {
            serialized: SmolStr::new(s),
            dt,
        })
    }
}

impl Serialize for Datetime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Datetime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::from_str(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Datetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
