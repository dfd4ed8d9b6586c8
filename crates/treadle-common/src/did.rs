//! Decentralized identifiers

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use crate::error::TypeError;

static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]+$").unwrap());

/// A repository owner's DID, e.g. `did:plc:ewvi7nxzyoun6zhxrhs64oiz`.
///
/// The core treats DIDs as opaque identifiers; only the surface syntax is
/// validated here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Did(SmolStr);

impl Did {
    /// Parse and validate a DID.
    pub fn new(s: &str) -> Result<Self, TypeError> {
        if DID_REGEX.is_match(s) {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(TypeError::InvalidDid(s.to_string()))
        }
    }

    /// The DID as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Did {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_methods() {
        assert!(Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").is_ok());
        assert!(Did::new("did:web:example.com").is_ok());
        assert!(Did::new("did:key:zDnaeh9v2RmcMo13Du2d6pjUf5bZwtauYxj3n9dYjw4EZUAR7").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Did::new("").is_err());
        assert!(Did::new("did:").is_err());
        assert!(Did::new("did:PLC:abc").is_err());
        assert!(Did::new("plc:abc").is_err());
        assert!(Did::new("did:plc:").is_err());
        assert!(Did::new("did:plc:has space").is_err());
    }
}
