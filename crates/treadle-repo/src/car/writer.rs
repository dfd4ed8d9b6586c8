//! CAR file writing utilities

use crate::error::{RepoError, Result};
use crate::mst::Mst;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarWriter;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Write blocks to a CAR file.
///
/// Roots should contain the head commit CID(s). Blocks are written in
/// sorted CID order (BTreeMap) for determinism.
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<IpldCid>,
    blocks: BTreeMap<IpldCid, Bytes>,
) -> Result<()> {
    let file = File::create(path).await.map_err(|e| RepoError::io(e))?;

    let header = iroh_car::CarHeader::new_v1(roots);
    let mut writer = CarWriter::new(header, file);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(|e| RepoError::car(e))?;
    }

    writer.finish().await.map_err(|e| RepoError::car(e))?;

    Ok(())
}

/// Write blocks to CAR bytes (in-memory).
///
/// Like [`write_car`] but produces a `Vec<u8>`; this is the path firehose
/// event payloads take.
pub async fn write_car_bytes(root: IpldCid, blocks: BTreeMap<IpldCid, Bytes>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let header = iroh_car::CarHeader::new_v1(vec![root]);
    let mut writer = CarWriter::new(header, &mut buffer);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(|e| RepoError::car(e))?;
    }

    writer.finish().await.map_err(|e| RepoError::car(e))?;

    buffer.flush().await.map_err(|e| RepoError::io(e))?;

    Ok(buffer)
}

/// Export a whole repository (commit + MST nodes + records) to a CAR file.
///
/// The commit block is written first, then MST nodes in walk order, then
/// record blocks, streaming rather than buffering the repository.
pub async fn export_repo_car<S: BlockStore + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<()> {
    let file = File::create(path).await.map_err(|e| RepoError::io(e))?;

    let header = iroh_car::CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, file);

    write_repo_blocks(&mut writer, commit_cid, mst).await?;

    writer.finish().await.map_err(|e| RepoError::car(e))?;

    Ok(())
}

/// Export a whole repository to in-memory CAR bytes.
pub async fn export_repo_car_bytes<S: BlockStore + Sync + 'static>(
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let header = iroh_car::CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, &mut buffer);

    write_repo_blocks(&mut writer, commit_cid, mst).await?;

    writer.finish().await.map_err(|e| RepoError::car(e))?;
    buffer.flush().await.map_err(|e| RepoError::io(e))?;

    Ok(buffer)
}

async fn write_repo_blocks<S, W>(
    writer: &mut CarWriter<W>,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<()>
where
    S: BlockStore + Sync + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin,
{
    let storage = mst.storage();
    let commit_data = storage
        .get(&commit_cid)
        .await?
        .ok_or_else(|| RepoError::not_found("commit", &commit_cid))?;

    writer
        .write(commit_cid, &commit_data)
        .await
        .map_err(|e| RepoError::car(e))?;

    mst.write_blocks_to_car(writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::reader::read_car;
    use crate::storage::memory::MemoryBlockStore;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use treadle_common::cid_for_block;

    #[tokio::test]
    async fn test_write_car_with_blocks() {
        let temp_file = NamedTempFile::new().unwrap();

        let data1 = Bytes::from_static(&[1, 2, 3]);
        let data2 = Bytes::from_static(&[4, 5, 6]);
        let cid1 = cid_for_block(&data1);
        let cid2 = cid_for_block(&data2);

        let mut blocks = BTreeMap::new();
        blocks.insert(cid1, data1.clone());
        blocks.insert(cid2, data2.clone());

        write_car(temp_file.path(), vec![cid1], blocks)
            .await
            .unwrap();

        let read_blocks = read_car(temp_file.path()).await.unwrap();
        assert_eq!(read_blocks.len(), 2);
        assert_eq!(read_blocks.get(&cid1).unwrap(), &data1);
        assert_eq!(read_blocks.get(&cid2).unwrap(), &data2);
    }

    #[tokio::test]
    async fn test_export_repo_to_car() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let record1 = Bytes::from_static(&[1, 1, 1]);
        let record2 = Bytes::from_static(&[2, 2, 2]);
        let cid1 = storage.put(&record1).await.unwrap();
        let cid2 = storage.put(&record2).await.unwrap();

        let mst = mst.add("app.bsky.feed.post/abc123", cid1).await.unwrap();
        let mst = mst.add("app.bsky.feed.post/def456", cid2).await.unwrap();
        mst.persist().await.unwrap();

        let commit_data = Bytes::from_static(&[99, 99, 99]);
        let commit_cid = storage.put(&commit_data).await.unwrap();

        let bytes = export_repo_car_bytes(commit_cid, &mst).await.unwrap();
        let parsed = crate::car::parse_car_bytes(&bytes).await.unwrap();

        assert_eq!(parsed.root, commit_cid);
        assert_eq!(parsed.blocks.get(&commit_cid).unwrap(), &commit_data);

        let root_cid = mst.root().await.unwrap();
        assert!(parsed.blocks.contains_key(&root_cid));
        assert!(parsed.blocks.contains_key(&cid1));
        assert!(parsed.blocks.contains_key(&cid2));
    }
}
