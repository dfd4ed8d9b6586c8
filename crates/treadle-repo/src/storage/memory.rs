//! In-memory block storage implementation

use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use treadle_common::cid_for_block;

/// In-memory block storage using a BTreeMap.
///
/// Useful for testing, temporary operations (e.g. assembling firehose
/// archives), and small repositories that fit in memory. Clones share the
/// underlying map.
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Create new memory store from a map of blocks
    pub fn new_from_blocks(blocks: BTreeMap<IpldCid, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.read().unwrap().is_empty()
    }

    /// Clear all blocks
    pub fn clear(&self) {
        self.blocks.write().unwrap().clear();
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = cid_for_block(data);
        self.blocks
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        let mut store = self.blocks.write().unwrap();
        for (cid, data) in blocks {
            store.insert(cid, data);
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap();
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(store.get(cid).cloned());
        }
        Ok(results)
    }

    async fn list_all(&self) -> Result<Vec<(IpldCid, Bytes)>> {
        let store = self.blocks.read().unwrap();
        Ok(store.iter().map(|(cid, data)| (*cid, data.clone())).collect())
    }
}
