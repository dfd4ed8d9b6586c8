//! Per-repository signing key persistence
//!
//! Losing a signing key invalidates the verifiability of the whole commit
//! chain, so keys are persisted on first use and reloaded on start. The
//! file store keeps one small `curve:hex(secret)` file per DID under a
//! directory; anything beyond that (KMS, database) implements [`KeyStore`]
//! itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use treadle_common::Did;
use treadle_common::crypto::{KeyCurve, SigningKeypair, sha256};

use crate::error::{RepoError, Result};

/// Async storage for per-DID signing keypairs.
#[trait_variant::make(Send)]
pub trait KeyStore: Clone {
    /// Load the signing keypair for a DID, `None` if it has none yet.
    async fn load(&self, did: &Did) -> Result<Option<SigningKeypair>>;

    /// Persist the signing keypair for a DID, replacing any existing one.
    async fn store(&self, did: &Did, keypair: &SigningKeypair) -> Result<()>;
}

fn curve_tag(curve: KeyCurve) -> &'static str {
    match curve {
        KeyCurve::P256 => "p256",
        KeyCurve::K256 => "k256",
    }
}

fn parse_curve_tag(tag: &str) -> Option<KeyCurve> {
    match tag {
        "p256" => Some(KeyCurve::P256),
        "k256" => Some(KeyCurve::K256),
        _ => None,
    }
}

/// In-memory key storage for tests and ephemeral servers.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    keys: Arc<RwLock<HashMap<Did, SigningKeypair>>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    async fn load(&self, did: &Did) -> Result<Option<SigningKeypair>> {
        Ok(self.keys.read().unwrap().get(did).cloned())
    }

    async fn store(&self, did: &Did, keypair: &SigningKeypair) -> Result<()> {
        self.keys
            .write()
            .unwrap()
            .insert(did.clone(), keypair.clone());
        Ok(())
    }
}

/// Directory-backed key storage: one `<sha256(did)>.key` file per DID
/// containing `curve:hex(secret)`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Create a store rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, did: &Did) -> PathBuf {
        // DIDs contain ':' and '%'; hash them into safe file names
        self.dir
            .join(format!("{}.key", hex::encode(sha256(did.as_str().as_bytes()))))
    }
}

impl KeyStore for FileKeyStore {
    async fn load(&self, did: &Did) -> Result<Option<SigningKeypair>> {
        let path = self.key_path(did);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepoError::io(e)),
        };

        let (tag, secret_hex) = content.trim().split_once(':').ok_or_else(|| {
            RepoError::new(crate::error::RepoErrorKind::Crypto, None)
                .with_context(format!("malformed key file: {}", path.display()))
        })?;
        let curve = parse_curve_tag(tag).ok_or_else(|| {
            RepoError::new(crate::error::RepoErrorKind::Crypto, None)
                .with_context(format!("unknown curve tag in key file: {}", tag))
        })?;
        let secret = hex::decode(secret_hex).map_err(|e| RepoError::crypto(e))?;

        Ok(Some(SigningKeypair::from_secret_bytes(curve, &secret)?))
    }

    async fn store(&self, did: &Did, keypair: &SigningKeypair) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| RepoError::io(e))?;

        let content = format!(
            "{}:{}\n",
            curve_tag(keypair.curve()),
            hex::encode(keypair.to_secret_bytes())
        );
        tokio::fs::write(self.key_path(did), content)
            .await
            .map_err(|e| RepoError::io(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip() {
        let store = MemoryKeyStore::new();
        let did = Did::new("did:plc:abc").unwrap();

        assert!(store.load(&did).await.unwrap().is_none());

        let keypair = SigningKeypair::generate(KeyCurve::P256);
        store.store(&did, &keypair).await.unwrap();

        let loaded = store.load(&did).await.unwrap().unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
    }

    #[tokio::test]
    async fn file_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let did = Did::new("did:plc:abc").unwrap();
        let keypair = SigningKeypair::generate(KeyCurve::K256);

        {
            let store = FileKeyStore::new(dir.path());
            assert!(store.load(&did).await.unwrap().is_none());
            store.store(&did, &keypair).await.unwrap();
        }

        // a fresh store over the same directory sees the key
        let store = FileKeyStore::new(dir.path());
        let loaded = store.load(&did).await.unwrap().unwrap();
        assert_eq!(loaded.curve(), KeyCurve::K256);
        assert_eq!(loaded.public_key(), keypair.public_key());
    }

    #[tokio::test]
    async fn distinct_dids_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());

        let did_a = Did::new("did:plc:aaa").unwrap();
        let did_b = Did::new("did:plc:bbb").unwrap();
        let key_a = SigningKeypair::generate(KeyCurve::P256);
        let key_b = SigningKeypair::generate(KeyCurve::P256);

        store.store(&did_a, &key_a).await.unwrap();
        store.store(&did_b, &key_b).await.unwrap();

        assert_eq!(
            store.load(&did_a).await.unwrap().unwrap().public_key(),
            key_a.public_key()
        );
        assert_eq!(
            store.load(&did_b).await.unwrap().unwrap().public_key(),
            key_b.public_key()
        );
    }
}
