//! MST node data structures

use std::fmt;

use cid::Cid as IpldCid;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::SmolStr;

use crate::{mst::Mst, storage::BlockStore};

/// Entry in an MST node - either a subtree or a leaf
///
/// This is the in-memory representation used for tree operations.
/// MST operations work on flat `Vec<NodeEntry>` where entries are
/// interleaved: `[Tree, Leaf, Tree, Leaf, Leaf, Tree]` etc.
///
/// The wire format is different - see [`NodeData`] and [`TreeEntry`].
#[derive(Clone)]
pub enum NodeEntry<S: BlockStore> {
    /// Subtree reference, lazily loaded from storage when needed
    Tree(Mst<S>),

    /// Leaf node with key-value pair
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: IpldCid,
    },
}

impl<S: BlockStore> fmt::Debug for NodeEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(_) => write!(f, "Tree"),
            NodeEntry::Leaf { key, value } => {
                write!(f, "Leaf {{ key: {}, value: {} }}", key, value)
            }
        }
    }
}

impl<S: BlockStore> NodeEntry<S> {
    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }
}

// ============================================================================
// Wire format structures
// ============================================================================
//
// A node is the 2-element CBOR array `[left, entries]`; each entry is the
// 4-element array `[prefixLen, keySuffix, value, tree]`. Key suffixes are
// text strings. Prefix compression is relative to the key immediately to
// the entry's left in the whole tree: the previous leaf in the same node,
// or for the first entry the key threaded in from outside the node (empty
// at the far left of the tree). Conversion lives in util.rs.

/// Wire format entry (prefix-compressed leaf with optional subtree pointer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Bytes shared with the preceding key
    pub prefix_len: u64,

    /// Key tail after the shared prefix
    pub key_suffix: SmolStr,

    /// CID of the record value
    pub value: IpldCid,

    /// Right-neighbor subtree for keys between this entry and the next,
    /// absent when there is none
    pub tree: Option<IpldCid>,
}

/// Wire format node data (serialized as DAG-CBOR)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Left-most subtree pointer, absent when there is none
    pub left: Option<IpldCid>,

    /// Entries in this node, sorted by full reconstructed key
    pub entries: Vec<TreeEntry>,
}

impl Serialize for NodeData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.left)?;
        tuple.serialize_element(&self.entries)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for NodeData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NodeDataVisitor;

        impl<'de> Visitor<'de> for NodeDataVisitor {
            type Value = NodeData;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 2-element [left, entries] array")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                use serde::de::Error;
                let left = seq
                    .next_element::<Option<IpldCid>>()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let entries = seq
                    .next_element::<Vec<TreeEntry>>()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;
                if seq.next_element::<serde::de::IgnoredAny>()?.is_some() {
                    return Err(A::Error::custom("node array has more than 2 elements"));
                }
                Ok(NodeData { left, entries })
            }
        }

        deserializer.deserialize_tuple(2, NodeDataVisitor)
    }
}

impl Serialize for TreeEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.prefix_len)?;
        tuple.serialize_element(self.key_suffix.as_str())?;
        tuple.serialize_element(&self.value)?;
        tuple.serialize_element(&self.tree)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for TreeEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TreeEntryVisitor;

        impl<'de> Visitor<'de> for TreeEntryVisitor {
            type Value = TreeEntry;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 4-element [prefixLen, keySuffix, value, tree] array")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                use serde::de::Error;
                let prefix_len = seq
                    .next_element::<u64>()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let key_suffix = seq
                    .next_element::<SmolStr>()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;
                let value = seq
                    .next_element::<IpldCid>()?
                    .ok_or_else(|| A::Error::invalid_length(2, &self))?;
                let tree = seq
                    .next_element::<Option<IpldCid>>()?
                    .ok_or_else(|| A::Error::invalid_length(3, &self))?;
                if seq.next_element::<serde::de::IgnoredAny>()?.is_some() {
                    return Err(A::Error::custom("entry array has more than 4 elements"));
                }
                Ok(TreeEntry {
                    prefix_len,
                    key_suffix,
                    value,
                    tree,
                })
            }
        }

        deserializer.deserialize_tuple(4, TreeEntryVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treadle_common::cid_for_block;

    #[test]
    fn node_wire_roundtrip() {
        let node = NodeData {
            left: Some(cid_for_block(b"left child")),
            entries: vec![
                TreeEntry {
                    prefix_len: 0,
                    key_suffix: SmolStr::new("app.example.post/abc"),
                    value: cid_for_block(b"record one"),
                    tree: None,
                },
                TreeEntry {
                    prefix_len: 17,
                    key_suffix: SmolStr::new("def"),
                    value: cid_for_block(b"record two"),
                    tree: Some(cid_for_block(b"subtree")),
                },
            ],
        };

        let cbor = serde_ipld_dagcbor::to_vec(&node).unwrap();
        let decoded: NodeData = serde_ipld_dagcbor::from_slice(&cbor).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn empty_node_wire_roundtrip() {
        let node = NodeData {
            left: None,
            entries: vec![],
        };
        let cbor = serde_ipld_dagcbor::to_vec(&node).unwrap();
        // [null, []] is exactly 3 bytes: 82 f6 80
        assert_eq!(cbor, vec![0x82, 0xf6, 0x80]);
        let decoded: NodeData = serde_ipld_dagcbor::from_slice(&cbor).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn node_is_encoded_as_array_not_map() {
        let node = NodeData {
            left: None,
            entries: vec![TreeEntry {
                prefix_len: 2,
                key_suffix: SmolStr::new("ricot"),
                value: cid_for_block(b"v"),
                tree: None,
            }],
        };
        let cbor = serde_ipld_dagcbor::to_vec(&node).unwrap();
        // major type 4 (array), length 2
        assert_eq!(cbor[0], 0x82);
        // entries array of one 4-element array
        assert_eq!(cbor[1], 0xf6); // null left
        assert_eq!(cbor[2], 0x81);
        assert_eq!(cbor[3], 0x84);
    }
}
