//! Record keys

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use crate::error::TypeError;
use crate::tid::Tid;

static RKEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._~-]+$").unwrap());

/// A record key: the final path segment of a record URI. Most record keys
/// are TIDs, but any printable name matching `[a-zA-Z0-9._~-]+` works.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Rkey(SmolStr);

impl Rkey {
    /// Parse and validate a record key.
    pub fn new(s: &str) -> Result<Self, TypeError> {
        if s.len() <= 512 && RKEY_REGEX.is_match(s) {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(TypeError::InvalidRkey(s.to_string()))
        }
    }

    /// The record key as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Tid> for Rkey {
    fn from(tid: Tid) -> Self {
        // TIDs are always valid record keys
        Self(SmolStr::new(tid.as_str()))
    }
}

impl FromStr for Rkey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Rkey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Rkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Rkey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Rkey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_keys() {
        assert!(Rkey::new("3kabcdefghijk").is_ok());
        assert!(Rkey::new("self").is_ok());
        assert!(Rkey::new("a-b_c.d~e").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Rkey::new("").is_err());
        assert!(Rkey::new("has space").is_err());
        assert!(Rkey::new("slash/inside").is_err());
        assert!(Rkey::new(&"x".repeat(513)).is_err());
    }
}
