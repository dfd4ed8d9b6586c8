//! Single-repository commit pipeline
//!
//! A [`Repository`] owns one DID's tree state: the current MST, the head
//! commit CID, and the latest revision. Writes are batched into
//! [`CommitData`] — the signed commit plus exactly the blocks it
//! introduced — which is then applied to storage and fanned out to the
//! firehose by the caller. A repository with no commits yet has no head
//! and an empty MST.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;
use treadle_common::value::RecordValue;
use treadle_common::{Did, Nsid, Rkey, Tid, Ticker};

use crate::commit::{Commit, RepoSigner};
use crate::error::{RepoError, Result};
use crate::mst::Mst;
use crate::storage::BlockStore;

/// A single record mutation within a commit.
#[derive(Debug, Clone)]
pub enum RecordWrite {
    /// Create a new record (error if the key exists)
    Create {
        /// Target collection
        collection: Nsid,
        /// Record key
        rkey: Rkey,
        /// Record body
        record: RecordValue,
    },

    /// Replace an existing record (error if the key is absent)
    Update {
        /// Target collection
        collection: Nsid,
        /// Record key
        rkey: Rkey,
        /// New record body
        record: RecordValue,
    },

    /// Delete a record (error if the key is absent)
    Delete {
        /// Target collection
        collection: Nsid,
        /// Record key
        rkey: Rkey,
    },
}

impl RecordWrite {
    /// The MST key this write touches: `collection/rkey`.
    pub fn key(&self) -> String {
        match self {
            Self::Create { collection, rkey, .. }
            | Self::Update { collection, rkey, .. }
            | Self::Delete { collection, rkey } => {
                format!("{}/{}", collection.as_str(), rkey.as_str())
            }
        }
    }
}

/// A formatted, signed commit ready to apply to storage.
///
/// `blocks` is a delta: the commit block, the MST nodes this commit
/// created, and the new record blocks - nothing the store already holds.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Commit CID
    pub cid: IpldCid,

    /// New revision TID
    pub rev: Tid,

    /// Previous revision TID (None for the initial commit)
    pub since: Option<Tid>,

    /// Previous commit CID (None for the initial commit)
    pub prev: Option<IpldCid>,

    /// New MST root CID
    pub data: IpldCid,

    /// Blocks to persist
    pub blocks: BTreeMap<IpldCid, Bytes>,
}

/// One DID's repository: MST plus commit-chain head.
pub struct Repository<S: BlockStore> {
    storage: Arc<S>,
    did: Did,
    mst: Mst<S>,
    head: Option<IpldCid>,
    rev: Option<Tid>,
    ticker: Ticker,
}

impl<S: BlockStore + Sync + 'static> Repository<S> {
    /// Create a repository with no commits yet.
    pub fn new(storage: Arc<S>, did: Did) -> Self {
        Self {
            mst: Mst::new(storage.clone()),
            storage,
            did,
            head: None,
            rev: None,
            ticker: Ticker::new(),
        }
    }

    /// Load a repository from its head commit CID.
    pub async fn load(storage: Arc<S>, head: IpldCid) -> Result<Self> {
        let commit_bytes = storage.get(&head).await?.ok_or_else(|| {
            RepoError::not_found("commit", &head)
                .with_help("the head commit must be in the block store before loading")
        })?;
        let commit = Commit::from_cbor(&commit_bytes)?;

        let mst = Mst::load(storage.clone(), commit.data, None, SmolStr::default());

        Ok(Self {
            storage,
            did: commit.did,
            mst,
            head: Some(head),
            rev: Some(commit.rev),
            ticker: Ticker::new(),
        })
    }

    /// The repository DID.
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// The head commit CID, `None` before the first commit.
    pub fn head(&self) -> Option<&IpldCid> {
        self.head.as_ref()
    }

    /// The latest revision, `None` before the first commit.
    pub fn rev(&self) -> Option<&Tid> {
        self.rev.as_ref()
    }

    /// The current MST.
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Shared reference to the block storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Mint a fresh TID-shaped record key.
    pub fn next_rkey(&mut self) -> Rkey {
        Rkey::from(self.ticker.next(None))
    }

    /// Look up a record CID by collection and rkey.
    pub async fn get_record(&self, collection: &Nsid, rkey: &Rkey) -> Result<Option<IpldCid>> {
        let key = format!("{}/{}", collection.as_str(), rkey.as_str());
        self.mst.get(&key).await
    }

    /// Apply record writes and format a signed commit.
    ///
    /// Canonicalizes each record to DAG-CBOR, stores the data blocks,
    /// threads the writes through the MST, collects the newly created MST
    /// node blocks, and signs a commit whose `prev` is the current head.
    /// Repository state is untouched until [`apply`](Self::apply).
    pub async fn create_commit(
        &mut self,
        writes: &[RecordWrite],
        signer: &impl RepoSigner,
    ) -> Result<CommitData> {
        let mut tree = self.mst.clone();
        let mut blocks: BTreeMap<IpldCid, Bytes> = BTreeMap::new();

        for write in writes {
            let key = write.key();
            tree = match write {
                RecordWrite::Create { record, .. } => {
                    if tree.get(&key).await?.is_some() {
                        return Err(RepoError::already_exists("record", &key));
                    }
                    let cbor = record
                        .to_dag_cbor()
                        .map_err(|e| RepoError::serialization(e))?;
                    let cid = self.storage.put(&cbor).await?;
                    blocks.insert(cid, Bytes::from(cbor));
                    tree.add(&key, cid).await?
                }
                RecordWrite::Update { record, .. } => {
                    if tree.get(&key).await?.is_none() {
                        return Err(RepoError::not_found("record", &key));
                    }
                    let cbor = record
                        .to_dag_cbor()
                        .map_err(|e| RepoError::serialization(e))?;
                    let cid = self.storage.put(&cbor).await?;
                    blocks.insert(cid, Bytes::from(cbor));
                    tree.add(&key, cid).await?
                }
                RecordWrite::Delete { .. } => tree.delete(&key).await?,
            };
        }

        // delta of MST nodes this commit introduces
        let data = tree.collect_blocks("", &mut blocks).await?;

        let rev = self.ticker.next(self.rev.as_ref());
        let commit =
            Commit::new_unsigned(self.did.clone(), data, rev.clone(), self.head).sign(signer)?;

        let commit_cbor = commit.to_cbor()?;
        let commit_cid = treadle_common::cid_for_block(&commit_cbor);
        blocks.insert(commit_cid, Bytes::from(commit_cbor));

        tracing::debug!(
            did = %self.did,
            rev = %rev,
            commit = %commit_cid,
            new_blocks = blocks.len(),
            "formatted commit"
        );

        Ok(CommitData {
            cid: commit_cid,
            rev,
            since: self.rev.clone(),
            prev: self.head,
            data,
            blocks,
        })
    }

    /// Persist a formatted commit and advance the repository head.
    pub async fn apply(&mut self, commit_data: CommitData) -> Result<IpldCid> {
        if commit_data.prev != self.head {
            return Err(RepoError::invalid_commit(format!(
                "commit prev {:?} does not extend current head {:?}",
                commit_data.prev, self.head
            )));
        }

        self.storage.put_many(commit_data.blocks).await?;

        self.head = Some(commit_data.cid);
        self.rev = Some(commit_data.rev);
        self.mst = Mst::load(
            self.storage.clone(),
            commit_data.data,
            None,
            SmolStr::default(),
        );

        Ok(commit_data.cid)
    }

    /// Export the whole repository (head commit, MST nodes, records) as
    /// CARv1 bytes with the head commit as root.
    pub async fn export_car_bytes(&self) -> Result<Vec<u8>> {
        let head = self
            .head
            .ok_or_else(|| RepoError::not_found("head commit", self.did.as_str()))?;
        crate::car::export_repo_car_bytes(head, &self.mst).await
    }
}
