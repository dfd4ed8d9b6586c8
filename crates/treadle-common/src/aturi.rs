//! `at://` record URIs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

use crate::did::Did;
use crate::error::TypeError;
use crate::nsid::Nsid;
use crate::rkey::Rkey;

/// The canonical address of a record:
/// `at://{did}/{collection}/{rkey}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    did: Did,
    collection: Nsid,
    rkey: Rkey,
}

impl AtUri {
    /// Assemble a record URI from its validated parts.
    pub fn new(did: Did, collection: Nsid, rkey: Rkey) -> Self {
        Self {
            did,
            collection,
            rkey,
        }
    }

    /// The repository owner.
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// The collection segment.
    pub fn collection(&self) -> &Nsid {
        &self.collection
    }

    /// The record key segment.
    pub fn rkey(&self) -> &Rkey {
        &self.rkey
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| TypeError::InvalidAtUri(s.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        let (Some(did), Some(collection), Some(rkey)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TypeError::InvalidAtUri(s.to_string()));
        };
        Ok(Self {
            did: Did::new(did).map_err(|_| TypeError::InvalidAtUri(s.to_string()))?,
            collection: Nsid::new(collection)
                .map_err(|_| TypeError::InvalidAtUri(s.to_string()))?,
            rkey: Rkey::new(rkey).map_err(|_| TypeError::InvalidAtUri(s.to_string()))?,
        })
    }
}

impl Serialize for AtUri {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&value).map_err(D::Error::custom)
    }
}
