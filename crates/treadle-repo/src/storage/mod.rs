//! Block storage abstraction for MST nodes, commits, and records

use crate::error::Result;
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Async content-addressed block storage.
///
/// Keys are CIDs computed as sha2-256 over the block bytes under the
/// dag-cbor codec, so the mapping from bytes to CID is a pure function and
/// `put` is idempotent: storing identical bytes twice yields the same CID
/// and must not error. Implementations must tolerate concurrent `put` of
/// identical bytes (duplicates are no-ops after the first).
///
/// Clone is required so the MST can share storage references across tree
/// operations.
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID.
    ///
    /// Returns `None` if the block is not present; absence is not an error.
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Put a block, returning its content-derived CID.
    async fn put(&self, data: &[u8]) -> Result<IpldCid>;

    /// Check if a block exists without retrieving it.
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Put many blocks at once (batch-write optimization).
    ///
    /// The provided CIDs are trusted to match the data; implementations may
    /// recompute and validate them.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Get multiple blocks at once (batch-read optimization).
    ///
    /// Returns a vec of the same length as the input, with `None` for
    /// missing blocks.
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;

    /// Enumerate every stored block, in unspecified order.
    ///
    /// Used for whole-store archive export.
    async fn list_all(&self) -> Result<Vec<(IpldCid, Bytes)>>;
}

pub mod file;
pub mod memory;

pub use file::FileBlockStore;
pub use memory::MemoryBlockStore;
