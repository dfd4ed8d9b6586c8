//! Namespaced collection identifiers

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use crate::error::TypeError;

static NSID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)+$").unwrap());

/// A collection identifier: a dotted lower-case name with at least two
/// segments, e.g. `app.bsky.feed.post`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Nsid(SmolStr);

impl Nsid {
    /// Parse and validate a collection NSID.
    pub fn new(s: &str) -> Result<Self, TypeError> {
        if NSID_REGEX.is_match(s) {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(TypeError::InvalidNsid(s.to_string()))
        }
    }

    /// The NSID as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Nsid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Nsid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Nsid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Nsid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_names() {
        assert!(Nsid::new("app.bsky.feed.post").is_ok());
        assert!(Nsid::new("com.example.record").is_ok());
        assert!(Nsid::new("a.b").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Nsid::new("").is_err());
        assert!(Nsid::new("single").is_err());
        assert!(Nsid::new("App.Bsky.Feed.Post").is_err());
        assert!(Nsid::new("app..post").is_err());
        assert!(Nsid::new(".app.post").is_err());
        assert!(Nsid::new("app.post.").is_err());
        assert!(Nsid::new("app.1post").is_err());
    }
}
