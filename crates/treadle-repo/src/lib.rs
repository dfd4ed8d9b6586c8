//! Repository engine for the treadle personal data server
//!
//! This crate is the content-addressed core of the PDS:
//!
//! - **MST (Merkle Search Tree)**: immutable tree operations with a shape
//!   determined solely by the key/value set
//! - **Commits**: signed commit objects with low-S ECDSA signatures and
//!   verification
//! - **CAR I/O**: CARv1 import/export for repositories, block subsets,
//!   and firehose payloads
//! - **Firehose**: the sequenced commit event stream and its subscriber
//!   fan-out
//! - **Storage**: pluggable block storage with in-memory and file-backed
//!   implementations, plus signing-key persistence
//! - **Engine**: the per-DID write pipeline behind the RPC surface
//!
//! Every encoding here is deterministic — CIDs, signatures, archive
//! bytes, and event frames all hash or sign the exact bytes produced —
//! so the serialization rules (length-then-bytes map keys, omitted
//! absent fields, array-shaped MST nodes) are load-bearing and covered by
//! tests.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CARv1 archive utilities
pub mod car;
/// Commit structures and signature verification
pub mod commit;
/// The multi-actor PDS engine
pub mod engine;
pub mod error;
/// The commit firehose
pub mod firehose;
/// Signing-key persistence
pub mod keystore;
/// Merkle Search Tree implementation
pub mod mst;
/// Single-repository commit pipeline
pub mod repo;
pub(crate) mod serde_bytes_helper;
/// Block storage abstraction
pub mod storage;

pub use commit::{Commit, RepoSigner};
pub use engine::{CommitMeta, Pds, RecordOutput};
pub use error::{RepoError, RepoErrorKind, Result};
pub use firehose::{CommitEvent, FirehoseHub, SubscriberId};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use mst::Mst;
pub use repo::{CommitData, RecordWrite, Repository};
pub use storage::{BlockStore, FileBlockStore, MemoryBlockStore};
