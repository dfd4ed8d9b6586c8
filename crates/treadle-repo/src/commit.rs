//! Repository commit objects and signature handling
//!
//! A commit is a DAG-CBOR map binding a DID to an MST root. The unsigned
//! map holds exactly `did, rev, data, prev, version` (with `prev` omitted
//! entirely on the first commit, not encoded as null); the signed form
//! adds `sig`, a 64-byte low-S ECDSA signature over the SHA-256 of the
//! unsigned encoding. Field declaration order below is the serialized key
//! order: length-then-bytes.

use bytes::Bytes;
use cid::Cid as IpldCid;
use treadle_common::crypto::{PublicKey, SigningKeypair, sha256};
use treadle_common::{Did, Tid};

use crate::error::{CommitError, Result};

/// The only commit version this engine reads or writes.
pub const COMMIT_VERSION: i64 = 3;

/// A signed repository commit.
///
/// Stored as a block in the block store and in CAR archives, identified by
/// its CID; the head pointer of a repository names the latest one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Revision TID, strictly increasing along the commit chain
    pub rev: Tid,

    /// Signature bytes (64-byte `R ‖ S`, low-S)
    #[serde(with = "crate::serde_bytes_helper")]
    pub sig: Bytes,

    /// MST root CID
    pub data: IpldCid,

    /// Previous commit CID; omitted (not null) on the first commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<IpldCid>,

    /// Commit format version (always 3)
    pub version: i64,
}

/// The unsigned view of a commit, for signing and verification.
#[derive(serde::Serialize)]
struct UnsignedCommit<'a> {
    did: &'a Did,
    rev: &'a Tid,
    data: &'a IpldCid,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: Option<&'a IpldCid>,
    version: i64,
}

/// Anything that can produce a low-S ECDSA signature over a digest.
///
/// Implemented for [`SigningKeypair`] and for the raw p256/k256 signing
/// keys, so callers holding either can sign commits directly.
pub trait RepoSigner {
    /// Sign a 32-byte digest, returning the 64-byte `R ‖ S` encoding.
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Bytes>;
}

impl RepoSigner for SigningKeypair {
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Bytes> {
        Ok(SigningKeypair::sign_digest(self, digest)?)
    }
}

impl RepoSigner for p256::ecdsa::SigningKey {
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Bytes> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;
        let sig: p256::ecdsa::Signature = self
            .sign_prehash(digest)
            .map_err(|e| CommitError::Signing(Box::new(e)))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }
}

impl RepoSigner for k256::ecdsa::SigningKey {
    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Bytes> {
        use k256::ecdsa::signature::hazmat::PrehashSigner;
        let sig: k256::ecdsa::Signature = self
            .sign_prehash(digest)
            .map_err(|e| CommitError::Signing(Box::new(e)))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }
}

impl Commit {
    /// Create a new unsigned commit (version 3, empty signature).
    pub fn new_unsigned(did: Did, data: IpldCid, rev: Tid, prev: Option<IpldCid>) -> Self {
        Self {
            did,
            rev,
            sig: Bytes::new(),
            data,
            prev,
            version: COMMIT_VERSION,
        }
    }

    /// Sign this commit with a key.
    pub fn sign(mut self, key: &impl RepoSigner) -> Result<Self> {
        let digest = sha256(&self.unsigned_bytes()?);
        self.sig = key.sign_digest(&digest)?;
        Ok(self)
    }

    /// The DAG-CBOR encoding of the unsigned commit map.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = UnsignedCommit {
            did: &self.did,
            rev: &self.rev,
            data: &self.data,
            prev: self.prev.as_ref(),
            version: self.version,
        };
        serde_ipld_dagcbor::to_vec(&unsigned)
            .map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Serialize the signed commit to DAG-CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Deserialize a signed commit from DAG-CBOR.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let commit: Self = serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| CommitError::Serialization(Box::new(e)))?;
        if commit.version != COMMIT_VERSION {
            return Err(CommitError::InvalidVersion(commit.version).into());
        }
        Ok(commit)
    }

    /// Compute the CID of this signed commit.
    pub fn to_cid(&self) -> Result<IpldCid> {
        Ok(treadle_common::cid_for_block(&self.to_cbor()?))
    }

    /// Verify the signature against a public key.
    pub fn verify(&self, pubkey: &PublicKey) -> std::result::Result<(), CommitError> {
        if self.sig.len() != 64 {
            return Err(CommitError::InvalidSignature(format!(
                "expected 64 bytes, got {}",
                self.sig.len()
            )));
        }
        let unsigned = self
            .unsigned_bytes()
            .map_err(|e| CommitError::Serialization(Box::new(e)))?;
        let digest = sha256(&unsigned);
        if pubkey.verify(&digest, &self.sig) {
            Ok(())
        } else {
            Err(CommitError::SignatureVerificationFailed)
        }
    }
}
