//! Baseline data types for the treadle personal data server.
//!
//! Everything in this crate is plain data: content identifiers, the
//! identifier string types (DIDs, NSIDs, record keys, TIDs, datetimes,
//! `at://` URIs), the permissive record value model with its deterministic
//! DAG-CBOR encoding, and the crypto primitives used to sign repository
//! commits. The repository engine itself lives in `treadle-repo`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod aturi;
pub mod cid;
pub mod crypto;
pub mod datetime;
pub mod did;
pub mod error;
pub mod nsid;
pub mod rkey;
pub mod tid;
pub mod value;

pub use aturi::AtUri;
pub use self::cid::{cid_for_block, cid_from_digest, parse_repo_cid};
pub use crypto::{KeyCurve, PublicKey, SigningKeypair};
pub use datetime::Datetime;
pub use did::Did;
pub use error::TypeError;
pub use nsid::Nsid;
pub use rkey::Rkey;
pub use tid::{Tid, Ticker};
pub use value::RecordValue;
