//! Content identifier helpers
//!
//! Every block in a repository is addressed by a CIDv1 with the dag-cbor
//! codec and a sha2-256 multihash: 36 bytes total, `[0x01, 0x71, 0x12,
//! 0x20]` followed by the digest. The string form is `'b'` plus the
//! unpadded lower-case base32 of those bytes, which the `cid` crate
//! produces for v1 CIDs.

use cid::Cid;

use crate::crypto::sha256;

/// Multicodec code for DAG-CBOR content (0x71)
pub const DAG_CBOR: u64 = 0x71;

/// Multicodec code for the sha2-256 multihash (0x12)
pub const SHA2_256: u64 = 0x12;

/// Build a CID directly from a 32-byte SHA-256 digest.
pub fn cid_from_digest(digest: &[u8; 32]) -> Cid {
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, digest)
        .expect("a 32-byte digest always fits the multihash buffer");
    Cid::new_v1(DAG_CBOR, mh)
}

/// Compute the CID of a block: sha2-256 over the bytes, dag-cbor codec.
pub fn cid_for_block(data: &[u8]) -> Cid {
    cid_from_digest(&sha256(data))
}

/// Parse a CID string, accepting only the shape this repository format
/// uses (CIDv1, dag-cbor, sha2-256, 32-byte digest). Anything else,
/// including syntactically valid CIDs of other codecs, returns `None`.
pub fn parse_repo_cid(s: &str) -> Option<Cid> {
    let cid = Cid::try_from(s).ok()?;
    let mh = cid.hash();
    (cid.version() == cid::Version::V1
        && cid.codec() == DAG_CBOR
        && mh.code() == SHA2_256
        && mh.size() == 32)
        .then_some(cid)
}
