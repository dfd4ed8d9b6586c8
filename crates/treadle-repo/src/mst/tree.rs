//! Immutable Merkle Search Tree operations

use super::node::NodeEntry;
use super::util;
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Immutable Merkle Search Tree
///
/// MST operations return new tree instances, leaving the original
/// unchanged. This enables versioning and safe concurrent access to
/// different tree versions.
///
/// # Architecture
///
/// The tree uses a flat `Vec<NodeEntry>` representation in memory, where
/// `NodeEntry` is an enum of `Tree` (subtree) and `Leaf` (key-value pair)
/// and leaves carry full keys. Entries are interleaved:
/// `[Tree, Leaf, Tree, Leaf, Leaf, Tree]` etc. This makes the operations
/// plain Vec slicing and splicing.
///
/// The wire format uses prefix compression threaded through the whole
/// tree: a node's bytes depend on the key immediately to its left (its
/// *context*), so the cached CID is stored together with the context it
/// was computed under and recomputed when the context changes. The root
/// always serializes under the empty context.
///
/// # Layer-based structure
///
/// Keys are hashed (SHA-256) and leading zero bits determine the layer:
/// `layer = floor(leading_zeros / 2)` for a fanout of roughly 4. The
/// shape is a function of the key set alone, independent of insertion
/// order.
#[derive(Debug, Clone)]
pub struct Mst<S: BlockStore> {
    /// Block storage for loading/saving nodes (shared via Arc)
    storage: Arc<S>,

    /// Flat list of entries (lazy-loaded, interior mutable)
    ///
    /// `None` means not yet loaded from storage.
    entries: Arc<RwLock<Option<Vec<NodeEntry<S>>>>>,

    /// Cached CID plus the left-context key it was computed under.
    ///
    /// `None` after any modification; repopulated by `compute_cid`.
    /// While `entries` is unloaded this doubles as the load pointer, and
    /// its context tells the decoder how to reconstruct full keys.
    pointer: Arc<RwLock<Option<(IpldCid, SmolStr)>>>,

    /// Layer hint for this node (`None` = compute from entries)
    layer: Option<usize>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create an empty MST
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            entries: Arc::new(RwLock::new(Some(Vec::new()))),
            pointer: Arc::new(RwLock::new(None)),
            layer: Some(0),
        }
    }

    /// Create an MST with existing entries (used internally)
    pub(crate) fn create(storage: Arc<S>, entries: Vec<NodeEntry<S>>, layer: Option<usize>) -> Self {
        Self {
            storage,
            entries: Arc::new(RwLock::new(Some(entries))),
            pointer: Arc::new(RwLock::new(None)),
            layer,
        }
    }

    /// Load an MST node from storage (lazy).
    ///
    /// `prev_key` is the left-context key the node was serialized under;
    /// nothing is read from storage until the entries are first needed.
    pub fn load(storage: Arc<S>, cid: IpldCid, layer: Option<usize>, prev_key: SmolStr) -> Self {
        Self {
            storage,
            entries: Arc::new(RwLock::new(None)),
            pointer: Arc::new(RwLock::new(Some((cid, prev_key)))),
            layer,
        }
    }

    /// Create new tree with modified entries (pointer invalidated)
    fn new_tree(&self, entries: Vec<NodeEntry<S>>) -> Self {
        Self {
            storage: self.storage.clone(),
            entries: Arc::new(RwLock::new(Some(entries))),
            pointer: Arc::new(RwLock::new(None)),
            layer: self.layer,
        }
    }

    /// Get entries (lazy load if needed)
    async fn get_entries(&self) -> Result<Vec<NodeEntry<S>>> {
        {
            let entries_guard = self.entries.read().await;
            if let Some(ref entries) = *entries_guard {
                return Ok(entries.clone());
            }
        }

        let (pointer, prev_key) = {
            let pointer_guard = self.pointer.read().await;
            pointer_guard
                .clone()
                .ok_or_else(|| RepoError::invalid_mst("MST node has neither entries nor pointer"))?
        };

        let node_bytes = self
            .storage
            .get(&pointer)
            .await?
            .ok_or_else(|| RepoError::not_found("MST node", &pointer))?;

        let node_data: super::node::NodeData =
            serde_ipld_dagcbor::from_slice(&node_bytes).map_err(|e| RepoError::serialization(e))?;

        let entries =
            util::deserialize_node_data(self.storage.clone(), &node_data, self.layer, &prev_key)?;

        {
            let mut entries_guard = self.entries.write().await;
            *entries_guard = Some(entries.clone());
        }

        Ok(entries)
    }

    /// Compute this node's CID under the given left-context key.
    ///
    /// Serializes (recursively resolving child CIDs) but does not persist.
    /// The result is cached together with the context; a later call with a
    /// different context recomputes.
    pub fn compute_cid<'a>(&'a self, prev_key: &'a str) -> BoxFuture<'a, Result<IpldCid>> {
        Box::pin(async move {
            {
                let pointer_guard = self.pointer.read().await;
                if let Some((cid, ctx)) = pointer_guard.as_ref() {
                    if ctx.as_str() == prev_key {
                        return Ok(*cid);
                    }
                }
            }

            // load entries before touching the pointer: decoding needs the
            // context the stored bytes were written under
            let entries = self.get_entries().await?;
            let node_data = util::serialize_node_data(&entries, prev_key).await?;
            let cbor =
                serde_ipld_dagcbor::to_vec(&node_data).map_err(|e| RepoError::serialization(e))?;
            let cid = util::node_cid(&cbor);

            {
                let mut pointer_guard = self.pointer.write().await;
                *pointer_guard = Some((cid, SmolStr::new(prev_key)));
            }

            Ok(cid)
        })
    }

    /// Root CID of the tree (serialized under the empty context)
    pub async fn root(&self) -> Result<IpldCid> {
        self.compute_cid("").await
    }

    /// Shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get the layer of this node.
    ///
    /// The layer of the first leaf, or one above the first subtree when
    /// the node holds no leaves.
    fn get_layer<'a>(&'a self) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if let Some(layer) = self.layer {
                return Ok(layer);
            }

            let entries = self.get_entries().await?;

            for entry in &entries {
                if let NodeEntry::Leaf { key, .. } = entry {
                    return Ok(util::layer_for_key(key.as_str()));
                }
            }

            for entry in &entries {
                if let NodeEntry::Tree(subtree) = entry {
                    let child_layer = subtree.get_layer().await?;
                    return Ok(child_layer + 1);
                }
            }

            Ok(0)
        })
    }

    /// Find index of first leaf >= key.
    ///
    /// Returns `entries.len()` if all leaves are < key.
    fn find_gt_or_equal_leaf_index_in(entries: &[NodeEntry<S>], key: &str) -> usize {
        for (i, entry) in entries.iter().enumerate() {
            if let NodeEntry::Leaf { key: leaf_key, .. } = entry {
                if leaf_key.as_str() >= key {
                    return i;
                }
            }
        }

        entries.len()
    }

    /// Get a value by key
    pub fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<IpldCid>>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(&entries, key);

            if index < entries.len() {
                if let NodeEntry::Leaf {
                    key: leaf_key,
                    value,
                } = &entries[index]
                {
                    if leaf_key.as_str() == key {
                        return Ok(Some(*value));
                    }
                }
            }

            // not at this level - descend into the subtree left of the
            // boundary
            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    return subtree.get(key).await;
                }
            }

            Ok(None)
        })
    }

    /// Add a key-value pair (returns new tree). Replaces the value when
    /// the key already exists.
    pub fn add<'a>(&'a self, key: &'a str, cid: IpldCid) -> BoxFuture<'a, Result<Mst<S>>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let key_layer = util::layer_for_key(key);
            let node_layer = self.get_layer().await?;
            let entries = self.get_entries().await?;

            if key_layer == node_layer {
                // key belongs at this layer - insert here
                let index = Self::find_gt_or_equal_leaf_index_in(&entries, key);

                if index < entries.len() {
                    if let NodeEntry::Leaf { key: leaf_key, .. } = &entries[index] {
                        if leaf_key.as_str() == key {
                            // key exists - replace the value only
                            let mut new_entries = entries.clone();
                            new_entries[index] = NodeEntry::Leaf {
                                key: SmolStr::new(key),
                                value: cid,
                            };
                            return Ok(self.new_tree(new_entries));
                        }
                    }
                }

                if index > 0 {
                    match &entries[index - 1] {
                        NodeEntry::Leaf { .. } => {
                            // neighbor is a leaf - splice in directly
                            self.splice_in(
                                NodeEntry::Leaf {
                                    key: SmolStr::new(key),
                                    value: cid,
                                },
                                index,
                                &entries,
                            )
                        }
                        NodeEntry::Tree(subtree) => {
                            // the straddling subtree splits around the key
                            let (left, right) = subtree.split_around(key).await?;
                            self.replace_with_split(
                                index - 1,
                                left,
                                NodeEntry::Leaf {
                                    key: SmolStr::new(key),
                                    value: cid,
                                },
                                right,
                                &entries,
                            )
                        }
                    }
                } else {
                    // at the far left
                    self.splice_in(
                        NodeEntry::Leaf {
                            key: SmolStr::new(key),
                            value: cid,
                        },
                        index,
                        &entries,
                    )
                }
            } else if key_layer < node_layer {
                // key belongs in a child subtree
                let index = Self::find_gt_or_equal_leaf_index_in(&entries, key);

                if index > 0 {
                    if let NodeEntry::Tree(prev_tree) = &entries[index - 1] {
                        let new_subtree = prev_tree.add(key, cid).await?;
                        return self.update_entry(index - 1, NodeEntry::Tree(new_subtree), &entries);
                    }
                }

                // no subtree at the boundary - create one
                let child = self.create_child().await?;
                let new_subtree = child.add(key, cid).await?;
                self.splice_in(NodeEntry::Tree(new_subtree), index, &entries)
            } else {
                // key belongs above this node - split and raise
                let extra_layers = key_layer - node_layer;

                let (mut left, mut right) = self.split_around(key).await?;

                // create intermediate layers if the gap is more than 1
                for _ in 1..extra_layers {
                    if let Some(l) = left {
                        left = Some(l.create_parent().await?);
                    }
                    if let Some(r) = right {
                        right = Some(r.create_parent().await?);
                    }
                }

                let mut new_entries = Vec::new();
                if let Some(l) = left {
                    new_entries.push(NodeEntry::Tree(l));
                }
                new_entries.push(NodeEntry::Leaf {
                    key: SmolStr::new(key),
                    value: cid,
                });
                if let Some(r) = right {
                    new_entries.push(NodeEntry::Tree(r));
                }

                Ok(Mst::create(
                    self.storage.clone(),
                    new_entries,
                    Some(key_layer),
                ))
            }
        })
    }

    /// Update an existing key (returns new tree)
    pub async fn update(&self, key: &str, cid: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;

        if self.get(key).await?.is_none() {
            return Err(RepoError::not_found("key", key));
        }

        // update is add with an existing key
        self.add(key, cid).await
    }

    /// Delete a key (returns new tree)
    pub fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Mst<S>>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let altered = self.delete_recurse(key).await?;
            altered.trim_top().await
        })
    }

    /// Recursively delete a key
    fn delete_recurse<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Mst<S>>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(&entries, key);

            if index < entries.len() {
                if let NodeEntry::Leaf { key: leaf_key, .. } = &entries[index] {
                    if leaf_key.as_str() == key {
                        let prev = if index > 0 {
                            Some(&entries[index - 1])
                        } else {
                            None
                        };
                        let next = entries.get(index + 1);

                        // subtrees on both sides merge across the gap
                        if let (
                            Some(NodeEntry::Tree(prev_tree)),
                            Some(NodeEntry::Tree(next_tree)),
                        ) = (prev, next)
                        {
                            let merged = prev_tree.append_merge(next_tree).await?;

                            let mut new_entries = entries[..index - 1].to_vec();
                            new_entries.push(NodeEntry::Tree(merged));
                            new_entries.extend_from_slice(&entries[index + 2..]);

                            return Ok(self.new_tree(new_entries));
                        }

                        return self.remove_entry(index, &entries);
                    }
                }
            }

            // not at this level - recurse into the boundary subtree
            if index > 0 {
                if let NodeEntry::Tree(prev_tree) = &entries[index - 1] {
                    let subtree = prev_tree.delete_recurse(key).await?;
                    let subtree_entries = subtree.get_entries().await?;

                    if subtree_entries.is_empty() {
                        return self.remove_entry(index - 1, &entries);
                    } else {
                        return self.update_entry(index - 1, NodeEntry::Tree(subtree), &entries);
                    }
                }
            }

            Err(RepoError::not_found("key", key))
        })
    }

    /// Update entry at index
    fn update_entry(
        &self,
        index: usize,
        entry: NodeEntry<S>,
        entries: &[NodeEntry<S>],
    ) -> Result<Mst<S>> {
        let mut entries = entries.to_vec();
        entries[index] = entry;
        Ok(self.new_tree(entries))
    }

    /// Remove entry at index
    fn remove_entry(&self, index: usize, entries: &[NodeEntry<S>]) -> Result<Mst<S>> {
        let mut entries = entries.to_vec();
        entries.remove(index);
        Ok(self.new_tree(entries))
    }

    /// Splice in entry at index
    fn splice_in(
        &self,
        entry: NodeEntry<S>,
        index: usize,
        entries: &[NodeEntry<S>],
    ) -> Result<Mst<S>> {
        let mut entries = entries.to_vec();
        entries.insert(index, entry);
        Ok(self.new_tree(entries))
    }

    /// Trim the top node while it holds nothing but a single subtree
    fn trim_top(self) -> BoxFuture<'static, Result<Mst<S>>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;

            if entries.len() == 1 {
                if let NodeEntry::Tree(subtree) = &entries[0] {
                    return subtree.clone().trim_top().await;
                }
            }

            Ok(self)
        })
    }

    /// Split the tree around a key into left and right subtrees.
    ///
    /// `left` holds all keys < key, `right` all keys > key (the key itself
    /// must not be present). Either side is `None` when empty.
    pub fn split_around<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<(Option<Mst<S>>, Option<Mst<S>>)>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(&entries, key);

            let left_data = entries[..index].to_vec();
            let right_data = entries[index..].to_vec();

            let mut left = self.new_tree(left_data.clone());
            let mut right = self.new_tree(right_data);

            // the subtree straddling the boundary splits recursively
            if let Some(NodeEntry::Tree(last_tree)) = left_data.last() {
                let left_len = left_data.len();
                let left_entries = left.get_entries().await?;
                left = left.remove_entry(left_len - 1, &left_entries)?;

                let (split_left, split_right) = last_tree.split_around(key).await?;

                if let Some(sl) = split_left {
                    let left_entries = left.get_entries().await?;
                    let mut appended = left_entries.clone();
                    appended.push(NodeEntry::Tree(sl));
                    left = left.new_tree(appended);
                }
                if let Some(sr) = split_right {
                    let right_entries = right.get_entries().await?;
                    let mut prepended = right_entries.clone();
                    prepended.insert(0, NodeEntry::Tree(sr));
                    right = right.new_tree(prepended);
                }
            }

            let left_out = if left.get_entries().await?.is_empty() {
                None
            } else {
                Some(left)
            };

            let right_out = if right.get_entries().await?.is_empty() {
                None
            } else {
                Some(right)
            };

            Ok((left_out, right_out))
        })
    }

    /// Merge two adjacent subtrees.
    ///
    /// All keys in `to_merge` must be greater than all keys in `self`.
    /// Used when a delete removes the leaf separating two subtrees.
    pub fn append_merge<'a>(&'a self, to_merge: &'a Mst<S>) -> BoxFuture<'a, Result<Mst<S>>> {
        Box::pin(async move {
            let self_layer = self.get_layer().await?;
            let merge_layer = to_merge.get_layer().await?;

            if self_layer != merge_layer {
                return Err(RepoError::invalid_mst(
                    "Cannot merge MST nodes from different layers",
                ));
            }

            let mut self_entries = self.get_entries().await?;
            let merge_entries = to_merge.get_entries().await?;

            let last_is_tree = matches!(self_entries.last(), Some(NodeEntry::Tree(_)));
            let first_is_tree = matches!(merge_entries.first(), Some(NodeEntry::Tree(_)));

            if last_is_tree && first_is_tree {
                // inner boundary subtrees merge recursively
                if let (Some(NodeEntry::Tree(left_tree)), Some(NodeEntry::Tree(right_tree))) =
                    (self_entries.last(), merge_entries.first())
                {
                    let merged = left_tree.append_merge(right_tree).await?;

                    let mut new_entries = self_entries[..self_entries.len() - 1].to_vec();
                    new_entries.push(NodeEntry::Tree(merged));
                    new_entries.extend_from_slice(&merge_entries[1..]);

                    return Ok(self.new_tree(new_entries));
                }
            }

            self_entries.extend(merge_entries);
            Ok(self.new_tree(self_entries))
        })
    }

    /// Create empty child tree at layer-1
    async fn create_child(&self) -> Result<Mst<S>> {
        let layer = self.get_layer().await?;
        let child_layer = Some(layer.saturating_sub(1));

        Ok(Mst::create(self.storage.clone(), Vec::new(), child_layer))
    }

    /// Create parent tree at layer+1 containing self
    async fn create_parent(self) -> Result<Mst<S>> {
        let layer = self.get_layer().await?;

        Ok(Mst::create(
            self.storage.clone(),
            vec![NodeEntry::Tree(self)],
            Some(layer + 1),
        ))
    }

    /// Replace entry at index with [left?, leaf, right?]
    fn replace_with_split(
        &self,
        index: usize,
        left: Option<Mst<S>>,
        leaf: NodeEntry<S>,
        right: Option<Mst<S>>,
        entries: &[NodeEntry<S>],
    ) -> Result<Mst<S>> {
        let mut new_entries = entries[..index].to_vec();

        if let Some(l) = left {
            new_entries.push(NodeEntry::Tree(l));
        }
        new_entries.push(leaf);
        if let Some(r) = right {
            new_entries.push(NodeEntry::Tree(r));
        }

        new_entries.extend_from_slice(&entries[index + 1..]);

        Ok(self.new_tree(new_entries))
    }

    /// All leaf entries (key-CID pairs) in lexicographic order
    pub fn leaves<'a>(&'a self) -> BoxFuture<'a, Result<Vec<(SmolStr, IpldCid)>>> {
        Box::pin(async move {
            let mut result = Vec::new();
            self.collect_leaves(&mut result).await?;
            Ok(result)
        })
    }

    /// Recursively collect all leaves into the result vector
    fn collect_leaves<'a>(
        &'a self,
        result: &'a mut Vec<(SmolStr, IpldCid)>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;

            for entry in entries {
                match entry {
                    NodeEntry::Tree(subtree) => {
                        subtree.collect_leaves(result).await?;
                    }
                    NodeEntry::Leaf { key, value } => {
                        result.push((key, value));
                    }
                }
            }

            Ok(())
        })
    }

    /// Collect the blocks this tree needs persisted, as a delta.
    ///
    /// Walks the tree serializing nodes, skipping any subtree whose bytes
    /// under the current context are already in storage; what remains is
    /// exactly the set of nodes a commit created or touched. Returns this
    /// node's CID under `prev_key`.
    pub fn collect_blocks<'a>(
        &'a self,
        prev_key: &'a str,
        blocks: &'a mut BTreeMap<IpldCid, Bytes>,
    ) -> BoxFuture<'a, Result<IpldCid>> {
        Box::pin(async move {
            let cid = self.compute_cid(prev_key).await?;

            if self.storage.has(&cid).await? {
                // this subtree was persisted by an earlier commit
                return Ok(cid);
            }

            let entries = self.get_entries().await?;
            let node_data = util::serialize_node_data(&entries, prev_key).await?;
            let cbor =
                serde_ipld_dagcbor::to_vec(&node_data).map_err(|e| RepoError::serialization(e))?;
            blocks.insert(cid, Bytes::from(cbor));

            let mut last_key = SmolStr::new(prev_key);
            for entry in &entries {
                match entry {
                    NodeEntry::Tree(subtree) => {
                        subtree.collect_blocks(&last_key, blocks).await?;
                    }
                    NodeEntry::Leaf { key, .. } => {
                        last_key = key.clone();
                    }
                }
            }

            Ok(cid)
        })
    }

    /// Persist all unstored node blocks; returns the root CID.
    pub async fn persist(&self) -> Result<IpldCid> {
        let mut blocks = BTreeMap::new();
        let root_cid = self.collect_blocks("", &mut blocks).await?;

        if !blocks.is_empty() {
            self.storage.put_many(blocks).await?;
        }

        Ok(root_cid)
    }

    /// Write all MST node and record blocks to a CAR writer.
    ///
    /// Nodes are read back from storage (the tree must be persisted) and
    /// streamed in walk order; record blocks follow. A record missing from
    /// the store is a structural error, not a skip.
    pub async fn write_blocks_to_car<W: tokio::io::AsyncWrite + Send + Unpin>(
        &self,
        writer: &mut iroh_car::CarWriter<W>,
    ) -> Result<()> {
        let mut leaf_cids = Vec::new();

        self.write_mst_nodes_to_car("", writer, &mut leaf_cids).await?;

        let leaf_blocks = self.storage.get_many(&leaf_cids).await?;
        for (cid, maybe_data) in leaf_cids.iter().zip(leaf_blocks) {
            let data = maybe_data.ok_or_else(|| RepoError::not_found("record block", cid))?;
            writer
                .write(*cid, &data)
                .await
                .map_err(|e| RepoError::car(e))?;
        }

        Ok(())
    }

    /// Recursively write MST nodes to a CAR writer and collect leaf CIDs
    fn write_mst_nodes_to_car<'a, W: tokio::io::AsyncWrite + Send + Unpin>(
        &'a self,
        prev_key: &'a str,
        writer: &'a mut iroh_car::CarWriter<W>,
        leaf_cids: &'a mut Vec<IpldCid>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let cid = self.compute_cid(prev_key).await?;

            let node_bytes = self
                .storage
                .get(&cid)
                .await?
                .ok_or_else(|| RepoError::not_found("MST node", &cid))?;

            writer
                .write(cid, &node_bytes)
                .await
                .map_err(|e| RepoError::car(e))?;

            let entries = self.get_entries().await?;

            let mut last_key = SmolStr::new(prev_key);
            for entry in &entries {
                match entry {
                    NodeEntry::Leaf { key, value } => {
                        leaf_cids.push(*value);
                        last_key = key.clone();
                    }
                    NodeEntry::Tree(subtree) => {
                        subtree
                            .write_mst_nodes_to_car(&last_key, writer, leaf_cids)
                            .await?;
                    }
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mst::node::NodeData;
    use crate::storage::memory::MemoryBlockStore;
    use treadle_common::cid_for_block;

    fn test_cid(n: u8) -> IpldCid {
        cid_for_block(&[n])
    }

    async fn decode_node(storage: &MemoryBlockStore, cid: &IpldCid) -> NodeData {
        let bytes = storage.get(cid).await.unwrap().unwrap();
        serde_ipld_dagcbor::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let entries = mst.get_entries().await.unwrap();
        assert_eq!(entries.len(), 0);
    }

    #[tokio::test]
    async fn test_get_from_empty() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let result = mst.get("test/key").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_add_single_key() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let updated = mst.add("test/key", test_cid(1)).await.unwrap();

        assert_eq!(updated.get("test/key").await.unwrap(), Some(test_cid(1)));
        assert_eq!(updated.get("test/other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_multiple_keys() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let mst = mst.add("a", test_cid(1)).await.unwrap();
        let mst = mst.add("b", test_cid(2)).await.unwrap();
        let mst = mst.add("c", test_cid(3)).await.unwrap();

        assert_eq!(mst.get("a").await.unwrap(), Some(test_cid(1)));
        assert_eq!(mst.get("b").await.unwrap(), Some(test_cid(2)));
        assert_eq!(mst.get("c").await.unwrap(), Some(test_cid(3)));
        assert_eq!(mst.get("d").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_replace_key() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let mst = mst.add("test", test_cid(1)).await.unwrap();
        let mst = mst.add("test", test_cid(2)).await.unwrap();

        assert_eq!(mst.get("test").await.unwrap(), Some(test_cid(2)));
        assert_eq!(mst.leaves().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_key_fails() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        assert!(mst.update("missing", test_cid(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_single_key() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let mst = mst.add("test", test_cid(1)).await.unwrap();
        let mst = mst.delete("test").await.unwrap();

        assert_eq!(mst.get("test").await.unwrap(), None);
        assert_eq!(mst.get_entries().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delete_from_multi_key_tree() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let mst = mst.add("a", test_cid(1)).await.unwrap();
        let mst = mst.add("b", test_cid(2)).await.unwrap();
        let mst = mst.add("c", test_cid(3)).await.unwrap();

        let mst = mst.delete("b").await.unwrap();

        assert_eq!(mst.get("a").await.unwrap(), Some(test_cid(1)));
        assert_eq!(mst.get("b").await.unwrap(), None);
        assert_eq!(mst.get("c").await.unwrap(), Some(test_cid(3)));
    }

    #[tokio::test]
    async fn test_delete_nonexistent_key() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage);

        let mst = mst.add("a", test_cid(1)).await.unwrap();

        let result = mst.delete("b").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_serialization_roundtrip() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let mst = mst.add("a", test_cid(1)).await.unwrap();
        let mst = mst.add("b", test_cid(2)).await.unwrap();
        let mst = mst.add("c", test_cid(3)).await.unwrap();

        let cid = mst.persist().await.unwrap();

        let reloaded = Mst::load(storage, cid, None, SmolStr::default());

        assert_eq!(reloaded.get("a").await.unwrap(), Some(test_cid(1)));
        assert_eq!(reloaded.get("b").await.unwrap(), Some(test_cid(2)));
        assert_eq!(reloaded.get("c").await.unwrap(), Some(test_cid(3)));
        assert_eq!(reloaded.root().await.unwrap(), cid);
    }

    #[tokio::test]
    async fn test_insertion_order_determinism() {
        // keys span several layers so splits and merges get exercised
        let keys = ["a", "b", "c", "d", "test"];

        let forward = {
            let storage = Arc::new(MemoryBlockStore::new());
            let mut mst = Mst::new(storage);
            for (i, key) in keys.iter().enumerate() {
                mst = mst.add(key, test_cid(i as u8)).await.unwrap();
            }
            mst.persist().await.unwrap()
        };

        let backward = {
            let storage = Arc::new(MemoryBlockStore::new());
            let mut mst = Mst::new(storage);
            for (i, key) in keys.iter().enumerate().rev() {
                mst = mst.add(key, test_cid(i as u8)).await.unwrap();
            }
            mst.persist().await.unwrap()
        };

        assert_eq!(forward, backward);
    }

    #[tokio::test]
    async fn test_all_permutations_same_root() {
        fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
            if items.len() <= 1 {
                return vec![items.to_vec()];
            }
            let mut out = Vec::new();
            for (i, &head) in items.iter().enumerate() {
                let mut rest = items.to_vec();
                rest.remove(i);
                for mut tail in permutations(&rest) {
                    tail.insert(0, head);
                    out.push(tail);
                }
            }
            out
        }

        let keys = ["apple", "apricot", "banana", "d"];
        let mut roots = Vec::new();

        for perm in permutations(&[0, 1, 2, 3]) {
            let storage = Arc::new(MemoryBlockStore::new());
            let mut mst = Mst::new(storage);
            for &i in &perm {
                mst = mst.add(keys[i], test_cid(i as u8)).await.unwrap();
            }
            roots.push(mst.persist().await.unwrap());
        }

        for root in &roots {
            assert_eq!(root, &roots[0]);
        }
    }

    #[tokio::test]
    async fn test_single_key_node_shape() {
        // one entry, full key as suffix, no subtrees
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let mst = mst.add("apple", test_cid(1)).await.unwrap();
        let root = mst.persist().await.unwrap();

        let node = decode_node(&storage, &root).await;
        assert_eq!(node.left, None);
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].prefix_len, 0);
        assert_eq!(node.entries[0].key_suffix.as_str(), "apple");
        assert_eq!(node.entries[0].value, test_cid(1));
        assert_eq!(node.entries[0].tree, None);

        assert_eq!(mst.get("apple").await.unwrap(), Some(test_cid(1)));
        assert_eq!(mst.get("banana").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_compression_threads_previous_key() {
        // "apple" hashes to a higher layer than "apricot", so the pair
        // persists as a root holding apple with apricot in its right
        // subtree; the subtree entry still compresses against "apple"
        for reversed in [false, true] {
            let storage = Arc::new(MemoryBlockStore::new());
            let mut mst = Mst::new(storage.clone());

            if reversed {
                mst = mst.add("apricot", test_cid(2)).await.unwrap();
                mst = mst.add("apple", test_cid(1)).await.unwrap();
            } else {
                mst = mst.add("apple", test_cid(1)).await.unwrap();
                mst = mst.add("apricot", test_cid(2)).await.unwrap();
            }

            let root = mst.persist().await.unwrap();
            let node = decode_node(&storage, &root).await;

            assert_eq!(node.left, None);
            assert_eq!(node.entries.len(), 1);
            assert_eq!(node.entries[0].prefix_len, 0);
            assert_eq!(node.entries[0].key_suffix.as_str(), "apple");

            let child_cid = node.entries[0].tree.expect("apricot subtree");
            let child = decode_node(&storage, &child_cid).await;
            assert_eq!(child.left, None);
            assert_eq!(child.entries.len(), 1);
            assert_eq!(child.entries[0].prefix_len, 2);
            assert_eq!(child.entries[0].key_suffix.as_str(), "ricot");
            assert_eq!(child.entries[0].value, test_cid(2));
            assert_eq!(child.entries[0].tree, None);
        }
    }

    #[tokio::test]
    async fn test_recreate_restores_root_cid() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let mst = mst.add("com.example.posts/key1", test_cid(1)).await.unwrap();
        let mst = mst.add("com.example.posts/key2", test_cid(2)).await.unwrap();
        let first = mst.persist().await.unwrap();

        let mst = mst.delete("com.example.posts/key2").await.unwrap();
        let mst = mst.add("com.example.posts/key2", test_cid(2)).await.unwrap();
        let second = mst.persist().await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_leaves_sorted() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut mst = Mst::new(storage);

        let keys = [
            "app.bsky.feed.post/3l4qpz7ajrc2a",
            "app.bsky.feed.like/3l4qpz7cjrc2c",
            "app.bsky.graph.follow/3l4qpz7ejrc2e",
            "app.bsky.feed.post/3l4qpz7bjrc2b",
        ];
        for (i, key) in keys.iter().enumerate() {
            mst = mst.add(key, test_cid(i as u8)).await.unwrap();
        }

        let leaves = mst.leaves().await.unwrap();
        assert_eq!(leaves.len(), 4);
        let mut sorted = leaves.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(leaves, sorted);
    }

    #[tokio::test]
    async fn test_collect_blocks_is_a_delta() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let mst = mst.add("com.example.posts/key1", test_cid(1)).await.unwrap();
        mst.persist().await.unwrap();
        let persisted_count = storage.len();
        assert!(persisted_count >= 1);

        // a second write should only surface the nodes it touched
        let mst = mst.add("com.example.posts/key2", test_cid(2)).await.unwrap();
        let mut blocks = BTreeMap::new();
        mst.collect_blocks("", &mut blocks).await.unwrap();

        assert!(!blocks.is_empty());
        for cid in blocks.keys() {
            assert!(!storage.has(cid).await.unwrap(), "delta contains old block");
        }
    }

    #[tokio::test]
    async fn test_deep_tree_many_keys() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut mst = Mst::new(storage.clone());

        let mut expected = Vec::new();
        for i in 0..100u8 {
            let key = format!("com.example.collection/record{:03}", i);
            mst = mst.add(&key, test_cid(i)).await.unwrap();
            expected.push((key, test_cid(i)));
        }

        for (key, cid) in &expected {
            assert_eq!(mst.get(key).await.unwrap(), Some(*cid));
        }

        // persist, reload, and read everything back
        let root = mst.persist().await.unwrap();
        let reloaded = Mst::load(storage, root, None, SmolStr::default());
        for (key, cid) in &expected {
            assert_eq!(reloaded.get(key).await.unwrap(), Some(*cid));
        }

        // delete half, the rest must survive
        let mut pruned = reloaded;
        for (key, _) in expected.iter().step_by(2) {
            pruned = pruned.delete(key).await.unwrap();
        }
        for (i, (key, cid)) in expected.iter().enumerate() {
            let got = pruned.get(key).await.unwrap();
            if i % 2 == 0 {
                assert_eq!(got, None);
            } else {
                assert_eq!(got, Some(*cid));
            }
        }
    }
}
