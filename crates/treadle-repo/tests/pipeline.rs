//! End-to-end write pipeline tests
//!
//! Drives the engine the way the RPC layer would: record writes in, CIDs
//! and commit metadata out, firehose frames and CAR archives checked
//! against what storage actually holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use smol_str::SmolStr;
use treadle_common::value::RecordValue;
use treadle_common::{Did, Nsid, Rkey};
use treadle_repo::car::parse_car_bytes;
use treadle_repo::{
    BlockStore, Commit, CommitEvent, FileKeyStore, KeyStore, MemoryBlockStore, MemoryKeyStore,
    Pds,
};

fn test_record(text: &str) -> RecordValue {
    let mut map = BTreeMap::new();
    map.insert(
        SmolStr::new("$type"),
        RecordValue::String(SmolStr::new("app.bsky.feed.post")),
    );
    map.insert(SmolStr::new("text"), RecordValue::String(SmolStr::new(text)));
    map.insert(
        SmolStr::new("createdAt"),
        RecordValue::String(SmolStr::new("2024-06-01T12:00:00.000Z")),
    );
    RecordValue::Object(map)
}

fn test_pds() -> Pds<MemoryBlockStore, MemoryKeyStore> {
    Pds::new(Arc::new(MemoryBlockStore::new()), MemoryKeyStore::new())
}

#[tokio::test]
async fn create_get_update_delete() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let created = pds
        .create_record(&did, &collection, &test_record("hello"), None)
        .await
        .unwrap();

    assert_eq!(created.uri.did(), &did);
    assert_eq!(created.uri.collection(), &collection);

    let rkey = created.uri.rkey().clone();
    let (uri, cid, value) = pds
        .get_record(&did, &collection, &rkey)
        .await
        .unwrap()
        .expect("record exists");
    assert_eq!(uri.to_string(), created.uri.to_string());
    assert_eq!(cid, created.cid);
    assert_eq!(value, test_record("hello"));

    // update through put_record
    let updated = pds
        .put_record(&did, &collection, &rkey, &test_record("edited"))
        .await
        .unwrap();
    assert_ne!(updated.cid, created.cid);
    assert_ne!(updated.commit.rev, created.commit.rev);

    let (_, cid, value) = pds
        .get_record(&did, &collection, &rkey)
        .await
        .unwrap()
        .expect("record exists");
    assert_eq!(cid, updated.cid);
    assert_eq!(value, test_record("edited"));

    // delete
    pds.delete_record(&did, &collection, &rkey).await.unwrap();
    assert!(
        pds.get_record(&did, &collection, &rkey)
            .await
            .unwrap()
            .is_none()
    );

    // deleting again is an error
    assert!(pds.delete_record(&did, &collection, &rkey).await.is_err());
}

#[tokio::test]
async fn create_duplicate_rkey_fails() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();
    let rkey = Rkey::new("self").unwrap();

    pds.create_record(&did, &collection, &test_record("one"), Some(rkey.clone()))
        .await
        .unwrap();
    assert!(
        pds.create_record(&did, &collection, &test_record("two"), Some(rkey))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn firehose_event_carries_the_commit_delta() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let (_id, mut rx) = pds.subscribe_repos(None).unwrap();

    let created = pds
        .create_record(&did, &collection, &test_record("first"), None)
        .await
        .unwrap();

    let frame = rx.recv().await.expect("event frame");
    let event = CommitEvent::from_cbor(&frame).unwrap();

    assert_eq!(event.seq, 1);
    assert_eq!(event.did, did);
    assert_eq!(event.rev, created.commit.rev);
    assert_eq!(event.commit, created.commit.cid);
    assert!(event.time.as_str().ends_with('Z'));

    // the event CAR: root is the commit, blocks hold the commit, the new
    // MST nodes, and the record
    let parsed = parse_car_bytes(&event.blocks).await.unwrap();
    assert_eq!(parsed.root, created.commit.cid);
    assert!(parsed.blocks.contains_key(&created.commit.cid));
    assert!(parsed.blocks.contains_key(&created.cid));

    // the commit block decodes, verifies under the repo's key, and points
    // at an MST root also present in the archive
    let commit = Commit::from_cbor(parsed.blocks.get(&created.commit.cid).unwrap()).unwrap();
    assert_eq!(commit.prev, None);
    assert!(parsed.blocks.contains_key(&commit.data));

    // a second write's delta excludes the first record
    let second = pds
        .create_record(&did, &collection, &test_record("second"), None)
        .await
        .unwrap();
    let frame = rx.recv().await.expect("event frame");
    let event = CommitEvent::from_cbor(&frame).unwrap();
    assert_eq!(event.seq, 2);

    let parsed = parse_car_bytes(&event.blocks).await.unwrap();
    assert!(parsed.blocks.contains_key(&second.cid));
    assert!(
        !parsed.blocks.contains_key(&created.cid),
        "delta should not resend the first record"
    );

    let commit = Commit::from_cbor(parsed.blocks.get(&second.commit.cid).unwrap()).unwrap();
    assert_eq!(commit.prev, Some(created.commit.cid));
}

#[tokio::test]
async fn commit_signatures_verify_with_persisted_key() {
    let storage = Arc::new(MemoryBlockStore::new());
    let keys = MemoryKeyStore::new();
    let pds = Pds::new(storage.clone(), keys.clone());

    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let created = pds
        .create_record(&did, &collection, &test_record("signed"), None)
        .await
        .unwrap();

    let keypair = keys.load(&did).await.unwrap().expect("key persisted");
    let commit_bytes = storage.get(&created.commit.cid).await.unwrap().unwrap();
    let commit = Commit::from_cbor(&commit_bytes).unwrap();
    commit.verify(&keypair.public_key()).unwrap();

    // another identity cannot forge it
    let other = treadle_common::SigningKeypair::generate(treadle_common::KeyCurve::K256);
    assert!(commit.verify(&other.public_key()).is_err());
}

#[tokio::test]
async fn signing_key_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryBlockStore::new());
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let first_commit_cid = {
        let pds = Pds::new(storage.clone(), FileKeyStore::new(dir.path()));
        pds.create_record(&did, &collection, &test_record("before restart"), None)
            .await
            .unwrap()
            .commit
            .cid
    };

    // a new engine over the same key directory signs with the same key
    let pds = Pds::new(storage.clone(), FileKeyStore::new(dir.path()));
    pds.restore_repo(first_commit_cid).await.unwrap();
    let second = pds
        .create_record(&did, &collection, &test_record("after restart"), None)
        .await
        .unwrap();

    let keypair = FileKeyStore::new(dir.path())
        .load(&did)
        .await
        .unwrap()
        .expect("key on disk");

    for commit_cid in [first_commit_cid, second.commit.cid] {
        let bytes = storage.get(&commit_cid).await.unwrap().unwrap();
        Commit::from_cbor(&bytes)
            .unwrap()
            .verify(&keypair.public_key())
            .unwrap();
    }
}

#[tokio::test]
async fn restore_repo_continues_the_chain() {
    let storage = Arc::new(MemoryBlockStore::new());
    let keys = MemoryKeyStore::new();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();
    let rkey = Rkey::new("kept").unwrap();

    let head = {
        let pds = Pds::new(storage.clone(), keys.clone());
        pds.create_record(&did, &collection, &test_record("kept"), Some(rkey.clone()))
            .await
            .unwrap()
            .commit
            .cid
    };

    let pds = Pds::new(storage.clone(), keys);
    let restored_did = pds.restore_repo(head).await.unwrap();
    assert_eq!(restored_did, did);

    // old record is readable
    assert!(
        pds.get_record(&did, &collection, &rkey)
            .await
            .unwrap()
            .is_some()
    );

    // new writes extend the restored head
    let next = pds
        .create_record(&did, &collection, &test_record("new"), None)
        .await
        .unwrap();
    let bytes = storage.get(&next.commit.cid).await.unwrap().unwrap();
    assert_eq!(Commit::from_cbor(&bytes).unwrap().prev, Some(head));
}

#[tokio::test]
async fn sync_get_repo_exports_everything_reachable() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let mut record_cids = Vec::new();
    let mut last_commit = None;
    for i in 0..20 {
        let out = pds
            .create_record(&did, &collection, &test_record(&format!("post {i}")), None)
            .await
            .unwrap();
        record_cids.push(out.cid);
        last_commit = Some(out.commit.cid);
    }

    let car = pds.sync_get_repo(&did).await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();

    let head = last_commit.unwrap();
    assert_eq!(parsed.root, head);
    assert!(parsed.blocks.contains_key(&head));
    for cid in &record_cids {
        assert!(parsed.blocks.contains_key(cid), "missing record block");
    }

    // the archive alone reconstructs the repository
    let imported = Arc::new(MemoryBlockStore::new_from_blocks(parsed.blocks));
    let repo = treadle_repo::Repository::load(imported, head).await.unwrap();
    assert_eq!(repo.did(), &did);
    let leaves = repo.mst().leaves().await.unwrap();
    assert_eq!(leaves.len(), 20);
}

#[tokio::test]
async fn sync_get_blocks_returns_just_those_blocks() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let a = pds
        .create_record(&did, &collection, &test_record("a"), None)
        .await
        .unwrap();
    let b = pds
        .create_record(&did, &collection, &test_record("b"), None)
        .await
        .unwrap();

    let car = pds.sync_get_blocks(&did, &[a.cid, b.cid]).await.unwrap();
    let parsed = parse_car_bytes(&car).await.unwrap();
    assert_eq!(parsed.blocks.len(), 2);
    assert!(parsed.blocks.contains_key(&a.cid));
    assert!(parsed.blocks.contains_key(&b.cid));

    // asking for an absent block is a structural error
    let missing = treadle_common::cid_for_block(b"never stored");
    assert!(pds.sync_get_blocks(&did, &[missing]).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_writes_to_different_repos() {
    let pds = Arc::new(test_pds());
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let mut handles = Vec::new();
    for actor in 0..4 {
        let pds = pds.clone();
        let collection = collection.clone();
        handles.push(tokio::spawn(async move {
            let did = Did::new(&format!("did:plc:actor{actor}")).unwrap();
            for i in 0..10 {
                pds.create_record(&did, &collection, &test_record(&format!("{i}")), None)
                    .await
                    .unwrap();
            }
            did
        }));
    }

    let mut dids = Vec::new();
    for handle in handles {
        dids.push(handle.await.unwrap());
    }

    // every event got a unique sequence number
    assert_eq!(pds.firehose().current_seq(), 40);

    // every repository holds its ten records
    for did in dids {
        let car = pds.sync_get_repo(&did).await.unwrap();
        let parsed = parse_car_bytes(&car).await.unwrap();
        let imported = Arc::new(MemoryBlockStore::new_from_blocks(parsed.blocks));
        let repo = treadle_repo::Repository::load(imported, parsed.root)
            .await
            .unwrap();
        assert_eq!(repo.mst().leaves().await.unwrap().len(), 10);
    }
}

#[tokio::test]
async fn per_repo_event_order_matches_commit_order() {
    let pds = test_pds();
    let did = Did::new("did:plc:alice").unwrap();
    let collection = Nsid::new("app.bsky.feed.post").unwrap();

    let (_id, mut rx) = pds.subscribe_repos(None).unwrap();

    for i in 0..5 {
        pds.create_record(&did, &collection, &test_record(&format!("{i}")), None)
            .await
            .unwrap();
    }

    let mut prev_seq = 0;
    let mut prev_rev = None;
    for _ in 0..5 {
        let frame = rx.recv().await.unwrap();
        let event = CommitEvent::from_cbor(&frame).unwrap();
        assert!(event.seq > prev_seq);
        if let Some(prev_rev) = &prev_rev {
            assert!(&event.rev > prev_rev);
        }
        prev_seq = event.seq;
        prev_rev = Some(event.rev);
    }
}

#[tokio::test]
async fn subscribe_with_future_cursor_fails() {
    let pds = test_pds();
    assert!(pds.subscribe_repos(Some(100)).is_err());
    assert!(pds.subscribe_repos(Some(0)).is_ok());
}
