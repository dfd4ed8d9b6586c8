//! The multi-actor PDS core
//!
//! [`Pds`] ties the pieces together: a shared block store, per-DID
//! signing keys, per-DID repositories behind their own mutexes, and the
//! firehose hub. Writes to one repository are serialized by its mutex so
//! the `prev` chain and MST root can never race; writes to different
//! repositories proceed in parallel. Sequence allocation and broadcast
//! happen while the actor lock is held, so per-repository event order on
//! the firehose matches commit order.
//!
//! The methods here carry the semantics of the RPC surface
//! (`createRecord`, `putRecord`, `getRecord`, `syncGetRepo`,
//! `syncGetBlocks`, `subscribeRepos`); transport, authentication, and
//! schema validation live in outer layers.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use treadle_common::crypto::{KeyCurve, SigningKeypair};
use treadle_common::value::RecordValue;
use treadle_common::{AtUri, Did, Nsid, Rkey, Tid};

use crate::car::write_car_bytes;
use crate::error::{RepoError, Result};
use crate::firehose::{CommitEvent, FirehoseHub, SubscriberId};
use crate::keystore::KeyStore;
use crate::repo::{CommitData, RecordWrite, Repository};
use crate::storage::BlockStore;

/// Default channel capacity handed to firehose subscribers.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Commit metadata returned from write operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    /// The new head commit CID
    pub cid: IpldCid,
    /// The new revision
    pub rev: Tid,
}

/// Result of a successful record write.
#[derive(Debug, Clone)]
pub struct RecordOutput {
    /// Canonical record URI
    pub uri: AtUri,
    /// CID of the record block
    pub cid: IpldCid,
    /// The commit that carried the write
    pub commit: CommitMeta,
}

/// The repository engine for a whole server: every hosted DID, their
/// signing keys, and the shared firehose.
pub struct Pds<S: BlockStore, K: KeyStore> {
    storage: Arc<S>,
    keys: K,
    hub: Arc<FirehoseHub>,
    actors: DashMap<Did, Arc<Mutex<Repository<S>>>>,
}

impl<S, K> Pds<S, K>
where
    S: BlockStore + Sync + 'static,
    K: KeyStore + Sync,
{
    /// Create an engine over the given block store and key store.
    pub fn new(storage: Arc<S>, keys: K) -> Self {
        Self {
            storage,
            keys,
            hub: Arc::new(FirehoseHub::new()),
            actors: DashMap::new(),
        }
    }

    /// The firehose hub (sequence counter + subscriber set).
    pub fn firehose(&self) -> &Arc<FirehoseHub> {
        &self.hub
    }

    /// The shared block store.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Restore a repository from a persisted head pointer.
    ///
    /// The host calls this at startup for each `(did, head)` row of its
    /// repository-state table; afterwards writes continue the chain.
    pub async fn restore_repo(&self, head: IpldCid) -> Result<Did> {
        let repo = Repository::load(self.storage.clone(), head).await?;
        let did = repo.did().clone();
        self.actors
            .insert(did.clone(), Arc::new(Mutex::new(repo)));
        Ok(did)
    }

    fn actor(&self, did: &Did) -> Arc<Mutex<Repository<S>>> {
        self.actors
            .entry(did.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Repository::new(
                    self.storage.clone(),
                    did.clone(),
                )))
            })
            .clone()
    }

    /// Fetch the signing key for a DID, generating and persisting one on
    /// first use.
    async fn signing_key(&self, did: &Did) -> Result<SigningKeypair> {
        if let Some(key) = self.keys.load(did).await? {
            return Ok(key);
        }
        let key = SigningKeypair::generate(KeyCurve::K256);
        self.keys.store(did, &key).await?;
        tracing::debug!(did = %did, "generated signing key");
        Ok(key)
    }

    /// Run one write through the commit pipeline and emit its firehose
    /// event. Caller must hold the actor lock for `repo`.
    async fn commit_writes(
        &self,
        repo: &mut Repository<S>,
        writes: &[RecordWrite],
    ) -> Result<CommitMeta> {
        let key = self.signing_key(repo.did()).await?;
        let commit: CommitData = repo.create_commit(writes, &key).await?;
        let event_blocks = commit.blocks.clone();
        repo.apply(commit.clone()).await?;

        // the event CAR is the commit delta with the commit as root
        let car = write_car_bytes(commit.cid, event_blocks).await?;
        let seq = self.hub.next_seq();
        let event = CommitEvent::new(
            seq,
            repo.did().clone(),
            commit.rev.clone(),
            commit.cid,
            Bytes::from(car),
        );
        self.hub.broadcast(&event)?;

        tracing::debug!(did = %repo.did(), seq, rev = %commit.rev, "committed and broadcast");

        Ok(CommitMeta {
            cid: commit.cid,
            rev: commit.rev,
        })
    }

    /// Create a record. When `rkey` is absent a fresh TID is minted.
    /// Errors if the record already exists.
    pub async fn create_record(
        &self,
        did: &Did,
        collection: &Nsid,
        record: &RecordValue,
        rkey: Option<Rkey>,
    ) -> Result<RecordOutput> {
        let actor = self.actor(did);
        let mut repo = actor.lock().await;

        let rkey = match rkey {
            Some(rkey) => rkey,
            None => repo.next_rkey(),
        };

        let record_cid = treadle_common::cid_for_block(
            &record.to_dag_cbor().map_err(|e| RepoError::serialization(e))?,
        );

        let commit = self
            .commit_writes(
                &mut repo,
                &[RecordWrite::Create {
                    collection: collection.clone(),
                    rkey: rkey.clone(),
                    record: record.clone(),
                }],
            )
            .await?;

        Ok(RecordOutput {
            uri: AtUri::new(did.clone(), collection.clone(), rkey),
            cid: record_cid,
            commit,
        })
    }

    /// Create or replace a record at a known key.
    pub async fn put_record(
        &self,
        did: &Did,
        collection: &Nsid,
        rkey: &Rkey,
        record: &RecordValue,
    ) -> Result<RecordOutput> {
        let actor = self.actor(did);
        let mut repo = actor.lock().await;

        let record_cid = treadle_common::cid_for_block(
            &record.to_dag_cbor().map_err(|e| RepoError::serialization(e))?,
        );

        let write = if repo.get_record(collection, rkey).await?.is_some() {
            RecordWrite::Update {
                collection: collection.clone(),
                rkey: rkey.clone(),
                record: record.clone(),
            }
        } else {
            RecordWrite::Create {
                collection: collection.clone(),
                rkey: rkey.clone(),
                record: record.clone(),
            }
        };

        let commit = self.commit_writes(&mut repo, &[write]).await?;

        Ok(RecordOutput {
            uri: AtUri::new(did.clone(), collection.clone(), rkey.clone()),
            cid: record_cid,
            commit,
        })
    }

    /// Delete a record. Errors if it does not exist.
    pub async fn delete_record(
        &self,
        did: &Did,
        collection: &Nsid,
        rkey: &Rkey,
    ) -> Result<CommitMeta> {
        let actor = self.actor(did);
        let mut repo = actor.lock().await;

        self.commit_writes(
            &mut repo,
            &[RecordWrite::Delete {
                collection: collection.clone(),
                rkey: rkey.clone(),
            }],
        )
        .await
    }

    /// Fetch a record: its URI, CID, and decoded value. `None` when the
    /// key is absent.
    pub async fn get_record(
        &self,
        did: &Did,
        collection: &Nsid,
        rkey: &Rkey,
    ) -> Result<Option<(AtUri, IpldCid, RecordValue)>> {
        let actor = self.actor(did);
        let repo = actor.lock().await;

        let Some(cid) = repo.get_record(collection, rkey).await? else {
            return Ok(None);
        };

        let bytes = self
            .storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::not_found("record block", &cid))?;
        let value: RecordValue =
            serde_ipld_dagcbor::from_slice(&bytes).map_err(|e| RepoError::serialization(e))?;

        Ok(Some((
            AtUri::new(did.clone(), collection.clone(), rkey.clone()),
            cid,
            value,
        )))
    }

    /// Export every block reachable from a repository's head as CARv1
    /// bytes, roots = `[head]`.
    pub async fn sync_get_repo(&self, did: &Did) -> Result<Vec<u8>> {
        let actor = self.actor(did);
        let repo = actor.lock().await;
        repo.export_car_bytes().await
    }

    /// Export just the named blocks as CARv1 bytes, roots = `[head]`.
    ///
    /// A CID missing from the store is a structural error, not a skip.
    pub async fn sync_get_blocks(&self, did: &Did, cids: &[IpldCid]) -> Result<Vec<u8>> {
        let actor = self.actor(did);
        let repo = actor.lock().await;
        let head = *repo
            .head()
            .ok_or_else(|| RepoError::not_found("repository", did.as_str()))?;

        let mut blocks = BTreeMap::new();
        for cid in cids {
            let data = self
                .storage
                .get(cid)
                .await?
                .ok_or_else(|| RepoError::not_found("block", cid))?;
            blocks.insert(*cid, data);
        }

        write_car_bytes(head, blocks).await
    }

    /// Subscribe to the commit firehose.
    ///
    /// Events are DAG-CBOR frames ([`CommitEvent`]). There is no event
    /// retention: a cursor at or before the current sequence joins the
    /// live tail, a future cursor is an error.
    pub fn subscribe_repos(
        &self,
        cursor: Option<i64>,
    ) -> Result<(SubscriberId, mpsc::Receiver<Bytes>)> {
        self.hub.subscribe(cursor, SUBSCRIBER_CAPACITY)
    }
}
