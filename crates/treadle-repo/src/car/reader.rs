//! CAR file reading utilities

use crate::error::{RepoError, Result};
use bytes::Bytes;
use cid::Cid as IpldCid;
use iroh_car::CarReader;
use n0_future::stream::StreamExt;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs::File;

/// Parsed CAR data
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// The first root CID from the CAR header
    pub root: IpldCid,
    /// All blocks in the archive
    pub blocks: BTreeMap<IpldCid, Bytes>,
}

/// Read an entire CAR file into memory.
///
/// Returns a BTreeMap of CID -> block data (sorted order for determinism).
pub async fn read_car(path: impl AsRef<Path>) -> Result<BTreeMap<IpldCid, Bytes>> {
    let file = File::open(path).await.map_err(|e| RepoError::io(e))?;

    let reader = CarReader::new(file).await.map_err(|e| RepoError::car(e))?;

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(|e| RepoError::car_parse(e))?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(blocks)
}

/// Read a CAR file header (roots only).
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<Vec<IpldCid>> {
    let file = File::open(path).await.map_err(|e| RepoError::io(e))?;

    let reader = CarReader::new(file).await.map_err(|e| RepoError::car(e))?;

    Ok(reader.header().roots().to_vec())
}

/// Parse in-memory CAR bytes into the first root and a block map.
///
/// This is the consumer side of firehose event payloads and sync
/// responses.
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    let reader = CarReader::new(data)
        .await
        .map_err(|e| RepoError::car_parse(e))?;

    let roots = reader.header().roots();
    let root = roots
        .first()
        .copied()
        .ok_or_else(|| RepoError::invalid("CAR archive has no roots"))?;

    let mut blocks = BTreeMap::new();
    let stream = reader.stream();
    n0_future::pin!(stream);

    while let Some(result) = stream.next().await {
        let (cid, data) = result.map_err(|e| RepoError::car_parse(e))?;
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(ParsedCar { root, blocks })
}
