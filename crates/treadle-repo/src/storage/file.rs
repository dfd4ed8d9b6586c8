//! CAR file-backed block storage

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use cid::Cid as IpldCid;
use treadle_common::cid_for_block;

use crate::error::Result;
use crate::storage::BlockStore;

/// CAR file-backed block storage.
///
/// Loads the entire CAR file into memory on construction and writes back
/// on [`flush`](FileBlockStore::flush). For very large repositories a
/// database-backed store is the better fit; this one covers simple
/// single-file persistence and tests.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    path: PathBuf,
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
    roots: Arc<RwLock<Vec<IpldCid>>>,
    dirty: Arc<RwLock<bool>>,
}

impl FileBlockStore {
    /// Load from existing CAR file
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let roots = crate::car::read_car_header(&path).await?;
        let blocks = crate::car::read_car(&path).await?;

        Ok(Self {
            path,
            blocks: Arc::new(RwLock::new(blocks)),
            roots: Arc::new(RwLock::new(roots)),
            dirty: Arc::new(RwLock::new(false)),
        })
    }

    /// Create new CAR file storage (empty).
    ///
    /// The file is not created until the first flush.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
            roots: Arc::new(RwLock::new(Vec::new())),
            dirty: Arc::new(RwLock::new(false)),
        }
    }

    /// Get the CAR file roots.
    ///
    /// In a repository CAR file, roots hold the head commit CID.
    pub fn roots(&self) -> Vec<IpldCid> {
        self.roots.read().unwrap().clone()
    }

    /// Set the CAR file roots (marks the store dirty).
    pub fn set_roots(&self, new_roots: Vec<IpldCid>) {
        *self.roots.write().unwrap() = new_roots;
        *self.dirty.write().unwrap() = true;
    }

    /// Write blocks back to the CAR file if dirty.
    pub async fn flush(&self) -> Result<()> {
        if !*self.dirty.read().unwrap() {
            return Ok(());
        }

        let blocks = self.blocks.read().unwrap().clone();
        let roots = self.roots.read().unwrap().clone();
        crate::car::write_car(&self.path, roots, blocks).await?;

        *self.dirty.write().unwrap() = false;
        Ok(())
    }

    /// Check if store has unflushed changes
    pub fn is_dirty(&self) -> bool {
        *self.dirty.read().unwrap()
    }

    /// Get the path to the CAR file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = cid_for_block(data);
        self.blocks
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        *self.dirty.write().unwrap() = true;
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
        *self.dirty.write().unwrap() = true;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_new_empty_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        assert!(storage.roots().is_empty());
        assert!(!storage.is_dirty());
        assert_eq!(storage.path(), temp_file.path());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let data = b"test data";
        let cid = storage.put(data).await.unwrap();

        assert!(storage.is_dirty());

        let retrieved = storage.get(&cid).await.unwrap().unwrap();
        assert_eq!(retrieved.as_ref(), data);
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let temp_file = NamedTempFile::new().unwrap();

        let storage = FileBlockStore::new(temp_file.path());
        let data1 = b"test data 1";
        let data2 = b"test data 2";
        let cid1 = storage.put(data1).await.unwrap();
        let cid2 = storage.put(data2).await.unwrap();

        storage.set_roots(vec![cid1]);
        assert!(storage.is_dirty());

        storage.flush().await.unwrap();
        assert!(!storage.is_dirty());

        let storage2 = FileBlockStore::load(temp_file.path()).await.unwrap();

        assert_eq!(storage2.roots(), vec![cid1]);
        assert_eq!(storage2.get(&cid1).await.unwrap().unwrap().as_ref(), data1);
        assert_eq!(storage2.get(&cid2).await.unwrap().unwrap().as_ref(), data2);
        assert!(!storage2.is_dirty());
    }

    #[tokio::test]
    async fn test_list_all() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let cid1 = storage.put(b"one").await.unwrap();
        let cid2 = storage.put(b"two").await.unwrap();

        let all = storage.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|(c, _)| *c == cid1));
        assert!(all.iter().any(|(c, _)| *c == cid2));
    }
}
