//! The record data model and its deterministic DAG-CBOR encoding
//!
//! [`RecordValue`] is the permissive value tree a PDS shuttles around:
//! whatever a client posts, minus floats. Records are canonicalized by
//! encoding to DAG-CBOR with map keys ordered length-then-bytes (shorter
//! keys first, byte-lexicographic within a length); the canonical bytes
//! are what gets hashed into a CID, so two structurally equal records
//! always land on the same block.
//!
//! JSON carries bytes as `{"$bytes": base64}` and CID links as
//! `{"$link": "b…"}`; in CBOR they are native byte strings and tag-42
//! links.

use std::collections::BTreeMap;

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};
use smol_str::SmolStr;

use crate::cid::parse_repo_cid;

/// Errors converting foreign representations into [`RecordValue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum DataError {
    /// Floating point numbers are not part of the data model
    #[error("floating point numbers are not allowed in record data")]
    FloatNotAllowed,

    /// Integer outside the i64 range
    #[error("integer out of range: {0}")]
    IntegerOutOfRange(String),

    /// `$link` value was not a valid repository CID
    #[error("invalid CID link: {0}")]
    InvalidLink(String),

    /// `$bytes` value was not valid base64
    #[error("invalid base64 in $bytes: {0}")]
    InvalidBytes(String),

    /// DAG-CBOR encoding failed
    #[error("DAG-CBOR encoding failed: {0}")]
    Encode(String),
}

/// A record value: the JSON data model plus byte strings and CID links,
/// minus floats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    /// CBOR/JSON null
    Null,
    /// Boolean
    Boolean(bool),
    /// Signed 64-bit integer (the only number type records may carry)
    Integer(i64),
    /// UTF-8 text
    String(SmolStr),
    /// Raw bytes
    Bytes(Bytes),
    /// A link to another block
    Link(Cid),
    /// Ordered array
    Array(Vec<RecordValue>),
    /// String-keyed object
    Object(BTreeMap<SmolStr, RecordValue>),
}

impl RecordValue {
    /// Canonical DAG-CBOR bytes of this value. These are the bytes that
    /// get hashed into the record's CID.
    pub fn to_dag_cbor(&self) -> Result<Vec<u8>, DataError> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| DataError::Encode(e.to_string()))
    }

    /// Convert from parsed JSON. Floats are rejected; single-key
    /// `{"$link": …}` and `{"$bytes": …}` objects become links and bytes.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DataError> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else {
                    return Err(if n.is_f64() {
                        DataError::FloatNotAllowed
                    } else {
                        DataError::IntegerOutOfRange(n.to_string())
                    });
                }
            }
            serde_json::Value::String(s) => Self::String(SmolStr::new(s)),
            serde_json::Value::Array(items) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    array.push(Self::from_json(item)?);
                }
                Self::Array(array)
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(link) = map.get("$link").and_then(|v| v.as_str()) {
                        let cid = parse_repo_cid(link)
                            .ok_or_else(|| DataError::InvalidLink(link.to_string()))?;
                        return Ok(Self::Link(cid));
                    }
                    if let Some(b64) = map.get("$bytes").and_then(|v| v.as_str()) {
                        let bytes = BASE64_STANDARD
                            .decode(b64)
                            .map_err(|e| DataError::InvalidBytes(e.to_string()))?;
                        return Ok(Self::Bytes(Bytes::from(bytes)));
                    }
                }
                let mut object = BTreeMap::new();
                for (key, value) in map {
                    object.insert(SmolStr::new(key), Self::from_json(value)?);
                }
                Self::Object(object)
            }
        })
    }

    /// Convert from a decoded IPLD tree (the targeted CBOR read path).
    pub fn from_ipld(ipld: &Ipld) -> Result<Self, DataError> {
        Ok(match ipld {
            Ipld::Null => Self::Null,
            Ipld::Bool(b) => Self::Boolean(*b),
            Ipld::Integer(i) => Self::Integer(
                i64::try_from(*i).map_err(|_| DataError::IntegerOutOfRange(i.to_string()))?,
            ),
            Ipld::Float(_) => return Err(DataError::FloatNotAllowed),
            Ipld::String(s) => Self::String(SmolStr::new(s)),
            Ipld::Bytes(b) => Self::Bytes(Bytes::copy_from_slice(b)),
            Ipld::Link(cid) => Self::Link(*cid),
            Ipld::List(items) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    array.push(Self::from_ipld(item)?);
                }
                Self::Array(array)
            }
            Ipld::Map(map) => {
                let mut object = BTreeMap::new();
                for (key, value) in map {
                    object.insert(SmolStr::new(key), Self::from_ipld(value)?);
                }
                Self::Object(object)
            }
        })
    }
}

impl Serialize for RecordValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::String(s) => serializer.serialize_str(s),
            Self::Bytes(bytes) => {
                if serializer.is_human_readable() {
                    let mut map = serializer.serialize_map(Some(1))?;
                    map.serialize_entry("$bytes", &BASE64_STANDARD.encode(bytes))?;
                    map.end()
                } else {
                    serializer.serialize_bytes(bytes)
                }
            }
            Self::Link(cid) => {
                if serializer.is_human_readable() {
                    let mut map = serializer.serialize_map(Some(1))?;
                    map.serialize_entry("$link", &cid.to_string())?;
                    map.end()
                } else {
                    cid.serialize(serializer)
                }
            }
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(object) => {
                // deterministic encoding: keys sorted by length, then bytes
                let mut keys: Vec<&SmolStr> = object.keys().collect();
                keys.sort_by(|a, b| {
                    a.len()
                        .cmp(&b.len())
                        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
                });
                let mut map = serializer.serialize_map(Some(object.len()))?;
                for key in keys {
                    map.serialize_entry(key.as_str(), &object[key])?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RecordValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ipld = Ipld::deserialize(deserializer)?;
        Self::from_ipld(&ipld).map_err(D::Error::custom)
    }
}
