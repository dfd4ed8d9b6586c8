//! MST utility functions

use super::node::{NodeData, NodeEntry, TreeEntry};
use crate::error::{MstError, Result};
use crate::storage::BlockStore;
use cid::Cid as IpldCid;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// Compute the CID of an encoded node (sha2-256, dag-cbor codec).
pub fn node_cid(data: &[u8]) -> IpldCid {
    treadle_common::cid_for_block(data)
}

/// Calculate the layer for a key based on its hash.
///
/// `layer = floor(leading_zero_bits(sha256(key)) / 2)`, which yields a
/// fanout of roughly 4: rarer keys land on higher layers.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

/// Count leading zero bits in a hash
fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validate MST key format
///
/// Keys are `collection/rkey` paths: `[a-zA-Z0-9._:~/-]+`, max 256 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > 256 {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: 256,
        }
        .into());
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '~' | '-' | '/'))
    {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Count the shared prefix length of two keys, in bytes.
///
/// Keys are validated ASCII so byte positions are char positions.
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Serialize flat entries to wire format (with prefix compression).
///
/// `prev_key` is the key immediately to this node's left in the whole
/// tree (empty at the far left); the first entry compresses against it,
/// later entries against their in-node predecessor. Subtree pointers are
/// resolved by recursively computing child CIDs under their own contexts.
pub async fn serialize_node_data<S: BlockStore + Sync + 'static>(
    entries: &[NodeEntry<S>],
    prev_key: &str,
) -> Result<NodeData> {
    let mut data = NodeData {
        left: None,
        entries: Vec::new(),
    };

    let mut i = 0;

    // First entry if Tree → becomes the left pointer, same context as us
    if let Some(NodeEntry::Tree(tree)) = entries.first() {
        data.left = Some(tree.compute_cid(prev_key).await?);
        i += 1;
    }

    let mut last_key: SmolStr = SmolStr::new(prev_key);
    while i < entries.len() {
        let entry = &entries[i];

        if let NodeEntry::Leaf { key, value } = entry {
            i += 1;

            let prefix_len = common_prefix_len(&last_key, key.as_str());
            let key_suffix = &key.as_str()[prefix_len..];

            // Tree after this Leaf → that leaf's right subtree, with the
            // leaf key as its context
            let tree_ptr = if let Some(NodeEntry::Tree(tree)) = entries.get(i) {
                i += 1;
                Some(tree.compute_cid(key.as_str()).await?)
            } else {
                None
            };

            data.entries.push(TreeEntry {
                prefix_len: prefix_len as u64,
                key_suffix: SmolStr::new(key_suffix),
                value: *value,
                tree: tree_ptr,
            });

            last_key = key.clone();
        } else {
            return Err(
                MstError::InvalidNode("Two Trees adjacent in flat entries".into()).into(),
            );
        }
    }

    Ok(data)
}

/// Deserialize wire format to flat entries.
///
/// `prev_key` is the same left-context key the node was serialized under;
/// full keys are reconstructed by threading it through the entries.
pub fn deserialize_node_data<S: BlockStore + Sync + 'static>(
    storage: std::sync::Arc<S>,
    data: &NodeData,
    layer: Option<usize>,
    prev_key: &str,
) -> Result<Vec<NodeEntry<S>>> {
    use crate::mst::Mst;

    let mut entries = Vec::new();
    let child_layer = layer.map(|l| l.saturating_sub(1));

    if let Some(left_cid) = data.left {
        entries.push(NodeEntry::Tree(Mst::load(
            storage.clone(),
            left_cid,
            child_layer,
            SmolStr::new(prev_key),
        )));
    }

    let mut last_key: SmolStr = SmolStr::new(prev_key);
    for entry in &data.entries {
        let prefix_len = entry.prefix_len as usize;
        if prefix_len > last_key.len() {
            return Err(MstError::InvalidNode(format!(
                "prefix length {} exceeds previous key length {}",
                prefix_len,
                last_key.len()
            ))
            .into());
        }
        let full_key = SmolStr::new(format!(
            "{}{}",
            &last_key.as_str()[..prefix_len],
            entry.key_suffix
        ));

        entries.push(NodeEntry::Leaf {
            key: full_key.clone(),
            value: entry.value,
        });

        if let Some(tree_cid) = entry.tree {
            entries.push(NodeEntry::Tree(Mst::load(
                storage.clone(),
                tree_cid,
                child_layer,
                full_key.clone(),
            )));
        }

        last_key = full_key;
    }

    Ok(entries)
}
