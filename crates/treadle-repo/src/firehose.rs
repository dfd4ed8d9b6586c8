//! The commit firehose: sequencing and subscriber fan-out
//!
//! A [`FirehoseHub`] is the process-wide (but not global — it is owned by
//! the server value and threaded in as a dependency) event spine: a
//! lock-free sequence counter and a concurrent subscriber set. Every
//! successful repository write is assigned a strictly increasing sequence
//! number and broadcast to all live subscribers as a DAG-CBOR frame.
//!
//! Delivery is best-effort: a subscriber whose channel is full or closed
//! is evicted and simply misses the rest of the stream. Send failures
//! never propagate back into the write that produced the event.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use cid::Cid as IpldCid;
use dashmap::DashMap;
use tokio::sync::mpsc;
use treadle_common::{Datetime, Did, Tid};

use crate::error::{RepoError, Result};

/// Event `$type` for commit frames on the firehose.
pub const COMMIT_EVENT_TYPE: &str = "com.atproto.sync.subscribeRepos#commit";

/// A commit event as broadcast to firehose subscribers.
///
/// Serialized as a DAG-CBOR map; field declaration order below is the
/// wire key order (length-then-bytes).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommitEvent {
    /// Repository the commit belongs to
    pub did: Did,

    /// Revision of the emitted commit
    pub rev: Tid,

    /// Stream sequence number, unique and strictly increasing
    pub seq: i64,

    /// Wall-clock time the event was broadcast (UTC)
    pub time: Datetime,

    /// Always [`COMMIT_EVENT_TYPE`]
    #[serde(rename = "$type")]
    pub kind: smol_str::SmolStr,

    /// CARv1 archive: root is the commit CID, blocks are the commit, the
    /// MST nodes it created, and the new records (a delta, not the whole
    /// repository)
    #[serde(with = "crate::serde_bytes_helper")]
    pub blocks: Bytes,

    /// CID of the commit block
    pub commit: IpldCid,
}

impl CommitEvent {
    /// Assemble a commit event stamped with the current time.
    pub fn new(seq: i64, did: Did, rev: Tid, commit: IpldCid, blocks: Bytes) -> Self {
        Self {
            did,
            rev,
            seq,
            time: Datetime::now(),
            kind: smol_str::SmolStr::new(COMMIT_EVENT_TYPE),
            blocks,
            commit,
        }
    }

    /// Encode the event frame as DAG-CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| RepoError::serialization(e))
    }

    /// Decode an event frame.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        serde_ipld_dagcbor::from_slice(data).map_err(|e| RepoError::serialization(e))
    }
}

/// Identifier handed out for each firehose subscription.
pub type SubscriberId = u64;

/// Sequencer plus subscriber registry for the commit firehose.
pub struct FirehoseHub {
    seq: AtomicI64,
    next_subscriber_id: AtomicU64,
    subscribers: DashMap<SubscriberId, mpsc::Sender<Bytes>>,
}

impl FirehoseHub {
    /// Create a hub with the sequence counter at zero.
    pub fn new() -> Self {
        Self {
            seq: AtomicI64::new(0),
            next_subscriber_id: AtomicU64::new(1),
            subscribers: DashMap::new(),
        }
    }

    /// Allocate the next sequence number (pre-increment + 1, atomic).
    ///
    /// No two calls ever observe the same value, in any interleaving.
    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Read the current sequence number without advancing it.
    pub fn current_seq(&self) -> i64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Reset the counter to zero. Test support only; never call this on a
    /// hub that has live subscribers.
    pub fn reset_seq(&self) {
        self.seq.store(0, Ordering::SeqCst);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a subscriber and return its id plus the frame receiver.
    ///
    /// `cursor` past the current sequence is an error (the future hasn't
    /// happened). Events are not retained, so any valid cursor joins the
    /// live tail; a caught-up consumer passes `None` or `current_seq`.
    pub fn subscribe(
        &self,
        cursor: Option<i64>,
        capacity: usize,
    ) -> Result<(SubscriberId, mpsc::Receiver<Bytes>)> {
        if let Some(cursor) = cursor {
            let current = self.current_seq();
            if cursor > current {
                return Err(RepoError::firehose(format!(
                    "cursor {} is ahead of the stream (current seq {})",
                    cursor, current
                )));
            }
        }

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.insert(id, tx);
        Ok((id, rx))
    }

    /// Remove a subscriber; subsequent broadcasts skip it.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Broadcast an event frame to every subscriber.
    ///
    /// The frame is encoded once. Any subscriber whose channel is full or
    /// closed is evicted; eviction is the only consequence of a send
    /// failure.
    pub fn broadcast(&self, event: &CommitEvent) -> Result<()> {
        let frame = Bytes::from(event.to_cbor()?);

        let mut evicted = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().try_send(frame.clone()).is_err() {
                evicted.push(*entry.key());
            }
        }

        for id in evicted {
            self.subscribers.remove(&id);
            tracing::warn!(subscriber = id, seq = event.seq, "evicting slow firehose subscriber");
        }

        Ok(())
    }
}

impl Default for FirehoseHub {
    fn default() -> Self {
        Self::new()
    }
}
