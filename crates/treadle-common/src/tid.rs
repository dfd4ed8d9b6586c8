//! Timestamp identifiers
//!
//! A TID packs a 53-bit millisecond timestamp and a 10-bit clock id into
//! 63 bits, rendered as 13 characters of sortable base-32. String order
//! equals numeric order, so TIDs double as revision identifiers and
//! default record keys.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use crate::error::TypeError;

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

const MILLIS_MASK: u64 = (1 << 53) - 1;
const CLKID_MASK: u64 = 0x3FF;

fn s32_encode(mut i: u64) -> SmolStr {
    let mut buf = [0u8; 13];
    for slot in buf.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }
    SmolStr::new(std::str::from_utf8(&buf).expect("base-32 alphabet is ASCII"))
}

fn s32_decode(s: &str) -> u64 {
    let mut i = 0u64;
    for b in s.bytes() {
        let v = S32_CHAR
            .iter()
            .position(|c| *c == b)
            .expect("validated TID characters") as u64;
        i = (i << 5) | v;
    }
    i
}

static TID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$").unwrap()
});

/// A timestamp identifier: 13 sortable base-32 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parse and validate a TID string.
    pub fn new(s: &str) -> Result<Self, TypeError> {
        if s.len() == 13 && TID_REGEX.is_match(s) {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(TypeError::InvalidTid(s.to_string()))
        }
    }

    /// Build a TID from a millisecond timestamp and 10-bit clock id.
    pub fn from_millis(millis: u64, clkid: u16) -> Self {
        let value = ((millis & MILLIS_MASK) << 10) | (clkid as u64 & CLKID_MASK);
        Self(s32_encode(value))
    }

    /// The TID as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The packed 63-bit value.
    pub fn as_u64(&self) -> u64 {
        s32_decode(self.0.as_str())
    }
}

impl FromStr for Tid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Tid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// A monotonic TID source.
///
/// Each ticker owns a random 10-bit clock id so TIDs minted by different
/// processes in the same millisecond stay distinct. `next` never returns
/// a value less than or equal to anything it has already issued, and can
/// additionally be handed the previous revision to stay strictly above it
/// even across restarts.
#[derive(Debug)]
pub struct Ticker {
    clkid: u16,
    last: u64,
}

impl Ticker {
    /// Create a ticker with a freshly drawn clock id.
    pub fn new() -> Self {
        Self {
            clkid: rand::random::<u16>() & CLKID_MASK as u16,
            last: 0,
        }
    }

    /// Mint the next TID, strictly greater than every TID this ticker has
    /// issued and than `prev` if given.
    pub fn next(&mut self, prev: Option<&Tid>) -> Tid {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64 & MILLIS_MASK;
        let mut value = (now << 10) | self.clkid as u64;
        if value <= self.last {
            value = self.last + 1;
        }
        if let Some(prev) = prev {
            let floor = prev.as_u64();
            if value <= floor {
                value = floor + 1;
            }
        }
        self.last = value;
        Tid(s32_encode(value))
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
