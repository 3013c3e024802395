//! MST node representations: the flat in-memory form and the CBOR wire form

use std::fmt;

use cid::Cid;
use smol_str::SmolStr;

use crate::mst::Mst;

/// One slot of an in-memory node.
///
/// A node is a flat `Vec<NodeEntry>` in key order where subtrees sit between
/// the leaves that bound them, e.g. `[Tree, Leaf, Leaf, Tree, Leaf]`. Two
/// `Tree` slots are never adjacent.
#[derive(Clone)]
pub enum NodeEntry<S> {
    /// Subtree one layer down, loaded lazily
    Tree(Mst<S>),

    /// Key/value pair living at this node's layer
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: Cid,
    },
}

impl<S> fmt::Debug for NodeEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(t) => write!(f, "{:?}", t),
            NodeEntry::Leaf { key, value } => write!(f, "Leaf({} -> {})", key, value),
        }
    }
}

impl<S> NodeEntry<S> {
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

    /// Get the subtree if this is a tree entry
    pub fn as_tree(&self) -> Option<&Mst<S>> {
        match self {
            NodeEntry::Tree(t) => Some(t),
            NodeEntry::Leaf { .. } => None,
        }
    }
}

/// Wire format entry: a prefix-compressed leaf plus the subtree to its right.
///
/// Field order is the DAG-CBOR canonical order (`k`, `p`, `t`, `v`).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    /// Key bytes after the shared prefix, encoded as a CBOR byte string
    #[serde(rename = "k", with = "serde_bytes")]
    pub key_suffix: Vec<u8>,

    /// Number of leading bytes shared with the previous key in this node
    #[serde(rename = "p")]
    pub prefix_len: u8,

    /// Subtree holding keys between this entry and the next; explicit `null` when absent
    #[serde(rename = "t")]
    pub tree: Option<Cid>,

    /// CID of the record value
    #[serde(rename = "v")]
    pub value: Cid,
}

/// Wire format node, the thing that is hashed and stored.
///
/// `left` is written as an explicit `null` when there is no left subtree.
/// Omitting it instead would change the bytes and therefore every CID above it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Entries in key order
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,

    /// Subtree holding keys below the first entry
    #[serde(rename = "l")]
    pub left: Option<Cid>,
}

impl NodeData {
    /// A node with no entries, the root of an empty tree
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            left: None,
        }
    }
}
