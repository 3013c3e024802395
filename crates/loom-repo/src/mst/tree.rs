//! Immutable Merkle Search Tree

use super::BoxFuture;
use super::node::{NodeData, NodeEntry};
use super::util::{self, find_gt_or_equal_leaf_index as find_index};
use super::walker::MstWalker;
use crate::block::{BlockMap, cid_for_cbor};
use crate::error::{MstError, RepoError, Result};
use crate::storage::{BlockStore, RepoStore};
use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Merkle Search Tree
///
/// A handle to one node of the tree. Handles are immutable: every mutation
/// returns a new handle and leaves the old one valid, sharing all untouched
/// subtrees with it.
///
/// Nodes are materialized on demand. A handle made by [`Mst::load`] knows
/// only its CID until something asks for its entries, at which point the
/// block is fetched and decoded once. A handle made from entries computes
/// its CID on first request to [`Mst::get_pointer`].
///
/// # Shape
///
/// Every key has a layer, a pure function of its hash (see
/// [`util::layer_for_key`]). A node at layer `n` holds exactly the keys of
/// layer `n` within its range, and subtrees for the gaps between them at
/// layer `n - 1`. Because of this, the same key/value set always yields the
/// same nodes and the same root CID, whatever order it was built in.
pub struct Mst<S> {
    storage: Arc<S>,
    node: Arc<Node<S>>,
}

struct Node<S> {
    entries: OnceCell<Vec<NodeEntry<S>>>,
    pointer: OnceCell<Cid>,
    layer: OnceCell<usize>,
    /// Node came from storage rather than from a mutation
    stored: bool,
}

impl<S> Clone for Mst<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            node: self.node.clone(),
        }
    }
}

impl<S> fmt::Debug for Mst<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.node.pointer.get(), self.node.entries.get()) {
            (Some(cid), _) => write!(f, "Mst({})", cid),
            (None, Some(entries)) => write!(f, "Mst(<unsaved, {} entries>)", entries.len()),
            (None, None) => write!(f, "Mst(<empty handle>)"),
        }
    }
}

impl<S: BlockStore + 'static> Mst<S> {
    /// An empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self::create(storage, Vec::new(), Some(0))
    }

    /// A node built from in-memory entries
    pub fn create(storage: Arc<S>, entries: Vec<NodeEntry<S>>, layer: Option<usize>) -> Self {
        Self {
            storage,
            node: Arc::new(Node {
                entries: OnceCell::new_with(Some(entries)),
                pointer: OnceCell::new(),
                layer: OnceCell::new_with(layer),
                stored: false,
            }),
        }
    }

    /// A handle to a stored node; nothing is read until it is needed
    pub fn load(storage: Arc<S>, cid: Cid, layer: Option<usize>) -> Self {
        Self {
            storage,
            node: Arc::new(Node {
                entries: OnceCell::new(),
                pointer: OnceCell::new_with(Some(cid)),
                layer: OnceCell::new_with(layer),
                stored: true,
            }),
        }
    }

    /// Build a tree by adding each pair in turn
    pub async fn from_leaves<K: AsRef<str>>(
        storage: Arc<S>,
        leaves: impl IntoIterator<Item = (K, Cid)>,
    ) -> Result<Self> {
        let mut tree = Self::new(storage);
        for (key, value) in leaves {
            tree = tree.add(key.as_ref(), value).await?;
        }
        Ok(tree)
    }

    fn new_tree(&self, entries: Vec<NodeEntry<S>>) -> Self {
        Self::create(self.storage.clone(), entries, self.node.layer.get().copied())
    }

    fn create_child(&self, layer: usize) -> Self {
        Self::create(self.storage.clone(), Vec::new(), Some(layer.saturating_sub(1)))
    }

    fn create_parent(self, layer: usize) -> Self {
        let storage = self.storage.clone();
        Self::create(storage, vec![NodeEntry::Tree(self)], Some(layer))
    }

    /// Backing storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// This node's entries, loading the block on first use
    pub async fn entries(&self) -> Result<&[NodeEntry<S>]> {
        let entries = self
            .node
            .entries
            .get_or_try_init(|| async {
                let cid = *self
                    .node
                    .pointer
                    .get()
                    .ok_or_else(|| RepoError::invalid_mst("node has neither entries nor CID"))?;
                let bytes = self
                    .storage
                    .get(&cid)
                    .await?
                    .ok_or_else(|| RepoError::missing_block(cid, "mst node"))?;
                let data: NodeData = serde_ipld_dagcbor::from_slice(&bytes).map_err(|e| {
                    RepoError::unexpected_object(cid, "mst node", Some(Box::new(e)))
                })?;

                let layer = match self.node.layer.get() {
                    Some(layer) => Some(*layer),
                    None => util::layer_from_data(&data)?,
                };
                if let Some(layer) = layer {
                    let _ = self.node.layer.set(layer);
                }
                util::deserialize_node_data(&self.storage, &data, layer)
            })
            .await?;
        Ok(entries.as_slice())
    }

    /// Layer of this node
    pub fn get_layer(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            if let Some(layer) = self.node.layer.get() {
                return Ok(*layer);
            }
            let entries = self.entries().await?;
            if let Some(layer) = self.node.layer.get() {
                return Ok(*layer);
            }
            let layer = match entries.iter().find_map(NodeEntry::leaf_key) {
                Some(key) => util::layer_for_key(key),
                None => match entries.first() {
                    Some(NodeEntry::Tree(child)) => child.get_layer().await? + 1,
                    _ => 0,
                },
            };
            let _ = self.node.layer.set(layer);
            Ok(layer)
        })
    }

    /// CID of this node, computed (and cached) from the entries if needed
    pub fn get_pointer(&self) -> BoxFuture<'_, Cid> {
        Box::pin(async move {
            let cid = self
                .node
                .pointer
                .get_or_try_init(|| async { self.serialize().await.map(|(cid, _)| cid) })
                .await?;
            Ok(*cid)
        })
    }

    async fn serialize(&self) -> Result<(Cid, Bytes)> {
        let data = util::serialize_node_data(self.entries().await?).await?;
        cid_for_cbor(&data)
    }

    /// Encoded node block
    pub async fn to_block(&self) -> Result<(Cid, Bytes)> {
        let (cid, bytes) = self.serialize().await?;
        let _ = self.node.pointer.set(cid);
        Ok((cid, bytes))
    }

    /// Look up the value stored under `key`
    pub async fn get(&self, key: &str) -> Result<Option<Cid>> {
        self.find(key).await
    }

    fn find<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Cid>> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let idx = find_index(entries, key);
            if let Some(NodeEntry::Leaf { key: k, value }) = entries.get(idx) {
                if k == key {
                    return Ok(Some(*value));
                }
            }
            match idx.checked_sub(1).and_then(|i| entries[i].as_tree()) {
                Some(subtree) => subtree.find(key).await,
                None => Ok(None),
            }
        })
    }

    /// Add a new key. Fails with `KeyExists` if the key is already present.
    pub async fn add(&self, key: &str, value: Cid) -> Result<Self> {
        util::validate_key(key)?;
        let key_layer = util::layer_for_key(key);
        let leaf = NodeEntry::Leaf {
            key: SmolStr::new(key),
            value,
        };
        if self.entries().await?.is_empty() {
            return Ok(Self::create(
                self.storage.clone(),
                vec![leaf],
                Some(key_layer),
            ));
        }
        self.insert(leaf, key_layer).await
    }

    fn insert(&self, leaf: NodeEntry<S>, key_layer: usize) -> BoxFuture<'_, Self> {
        Box::pin(async move {
            let key = leaf.leaf_key().map(SmolStr::new).unwrap_or_default();
            let entries = self.entries().await?;
            let layer = self.get_layer().await?;
            let idx = find_index(entries, &key);
            let prev = idx.checked_sub(1).and_then(|i| entries[i].as_tree());

            if key_layer == layer {
                if entries.get(idx).and_then(NodeEntry::leaf_key) == Some(key.as_str()) {
                    return Err(RepoError::key_exists(&key));
                }
                let mut updated = Vec::with_capacity(entries.len() + 2);
                match prev {
                    Some(prev) => {
                        let (left, right) = prev.split_around(&key).await?;
                        updated.extend_from_slice(&entries[..idx - 1]);
                        updated.extend(left.map(NodeEntry::Tree));
                        updated.push(leaf);
                        updated.extend(right.map(NodeEntry::Tree));
                    }
                    None => {
                        updated.extend_from_slice(&entries[..idx]);
                        updated.push(leaf);
                    }
                }
                updated.extend_from_slice(&entries[idx..]);
                Ok(self.new_tree(updated))
            } else if key_layer < layer {
                let mut updated = entries.to_vec();
                match prev {
                    Some(prev) => {
                        updated[idx - 1] = NodeEntry::Tree(prev.insert(leaf, key_layer).await?);
                    }
                    None => {
                        let child = self.create_child(layer).insert(leaf, key_layer).await?;
                        updated.insert(idx, NodeEntry::Tree(child));
                    }
                }
                Ok(self.new_tree(updated))
            } else {
                // The key outranks this whole node: split it and grow new layers on top.
                let (mut left, mut right) = self.split_around(&key).await?;
                for parent_layer in layer + 1..key_layer {
                    left = left.map(|t| t.create_parent(parent_layer));
                    right = right.map(|t| t.create_parent(parent_layer));
                }
                let mut updated = Vec::with_capacity(3);
                updated.extend(left.map(NodeEntry::Tree));
                updated.push(leaf);
                updated.extend(right.map(NodeEntry::Tree));
                Ok(Self::create(self.storage.clone(), updated, Some(key_layer)))
            }
        })
    }

    /// Replace the value of an existing key. Fails with `KeyNotFound` if absent.
    pub async fn update(&self, key: &str, value: Cid) -> Result<Self> {
        util::validate_key(key)?;
        self.replace(key, value).await
    }

    fn replace<'a>(&'a self, key: &'a str, value: Cid) -> BoxFuture<'a, Self> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let idx = find_index(entries, key);
            let mut updated = entries.to_vec();
            if entries.get(idx).and_then(NodeEntry::leaf_key) == Some(key) {
                updated[idx] = NodeEntry::Leaf {
                    key: SmolStr::new(key),
                    value,
                };
                return Ok(self.new_tree(updated));
            }
            match idx.checked_sub(1).and_then(|i| entries[i].as_tree()) {
                Some(subtree) => {
                    updated[idx - 1] = NodeEntry::Tree(subtree.replace(key, value).await?);
                    Ok(self.new_tree(updated))
                }
                None => Err(RepoError::key_not_found(key)),
            }
        })
    }

    /// Remove a key. Fails with `KeyNotFound` if absent.
    pub async fn delete(&self, key: &str) -> Result<Self> {
        util::validate_key(key)?;
        self.remove(key).await?.trim_top().await
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Self> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let idx = find_index(entries, key);
            let prev = idx.checked_sub(1).and_then(|i| entries[i].as_tree());

            if entries.get(idx).and_then(NodeEntry::leaf_key) == Some(key) {
                let next = entries.get(idx + 1).and_then(NodeEntry::as_tree);
                let mut updated = Vec::with_capacity(entries.len());
                match (prev, next) {
                    (Some(prev), Some(next)) => {
                        updated.extend_from_slice(&entries[..idx - 1]);
                        updated.push(NodeEntry::Tree(prev.append_merge(next).await?));
                        updated.extend_from_slice(&entries[idx + 2..]);
                    }
                    _ => {
                        updated.extend_from_slice(&entries[..idx]);
                        updated.extend_from_slice(&entries[idx + 1..]);
                    }
                }
                return Ok(self.new_tree(updated));
            }

            let Some(subtree) = prev else {
                return Err(RepoError::key_not_found(key));
            };
            let subtree = subtree.remove(key).await?;
            let mut updated = entries.to_vec();
            if subtree.entries().await?.is_empty() {
                updated.remove(idx - 1);
            } else {
                updated[idx - 1] = NodeEntry::Tree(subtree);
            }
            Ok(self.new_tree(updated))
        })
    }

    /// Split this node into the parts below and above `key`
    fn split_around<'a>(&'a self, key: &'a str) -> BoxFuture<'a, (Option<Self>, Option<Self>)> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let idx = find_index(entries, key);
            let mut left = entries[..idx].to_vec();
            let mut right = entries[idx..].to_vec();

            if let Some(NodeEntry::Tree(last)) = left.last().cloned() {
                left.pop();
                let (lower, upper) = last.split_around(key).await?;
                left.extend(lower.map(NodeEntry::Tree));
                if let Some(upper) = upper {
                    right.insert(0, NodeEntry::Tree(upper));
                }
            }

            let wrap = |part: Vec<NodeEntry<S>>| (!part.is_empty()).then(|| self.new_tree(part));
            Ok((wrap(left), wrap(right)))
        })
    }

    /// Concatenate two sibling subtrees of the same layer, merging the seam
    fn append_merge<'a>(&'a self, other: &'a Self) -> BoxFuture<'a, Self> {
        Box::pin(async move {
            if self.get_layer().await? != other.get_layer().await? {
                return Err(MstError::InvalidNode("merging subtrees of different layers".into()).into());
            }
            let left = self.entries().await?;
            let right = other.entries().await?;
            let mut merged = Vec::with_capacity(left.len() + right.len());
            match (left.split_last(), right.split_first()) {
                (Some((NodeEntry::Tree(l), left_rest)), Some((NodeEntry::Tree(r), right_rest))) => {
                    merged.extend_from_slice(left_rest);
                    merged.push(NodeEntry::Tree(l.append_merge(r).await?));
                    merged.extend_from_slice(right_rest);
                }
                _ => {
                    merged.extend_from_slice(left);
                    merged.extend_from_slice(right);
                }
            }
            Ok(self.new_tree(merged))
        })
    }

    /// Drop root nodes that only hold a single subtree
    fn trim_top(&self) -> BoxFuture<'_, Self> {
        Box::pin(async move {
            match self.entries().await? {
                [NodeEntry::Tree(only)] => only.trim_top().await,
                _ => Ok(self.clone()),
            }
        })
    }

    /// Pull-based in-order walk over all leaves
    pub async fn walker(&self) -> Result<MstWalker<S>> {
        MstWalker::seek(self, None).await
    }

    /// In-order walk over leaves with key `>= from`
    pub async fn walk_leaves_from(&self, from: &str) -> Result<MstWalker<S>> {
        MstWalker::seek(self, Some(from)).await
    }

    /// Every key/value pair in key order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, Cid)>> {
        let mut walker = self.walker().await?;
        let mut out = Vec::new();
        while let Some(leaf) = walker.next_leaf().await? {
            out.push(leaf);
        }
        Ok(out)
    }

    /// Number of keys in the tree
    pub async fn leaf_count(&self) -> Result<usize> {
        let mut walker = self.walker().await?;
        let mut count = 0;
        while walker.next_leaf().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Up to `count` pairs with keys strictly between `after` and `before`
    pub async fn list(
        &self,
        count: usize,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<(SmolStr, Cid)>> {
        let mut walker = match after {
            Some(after) => self.walk_leaves_from(after).await?,
            None => self.walker().await?,
        };
        let mut out = Vec::new();
        while out.len() < count {
            let Some((key, value)) = walker.next_leaf().await? else {
                break;
            };
            if Some(key.as_str()) == after {
                continue;
            }
            if before.is_some_and(|b| key.as_str() >= b) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// All pairs whose key starts with `prefix`
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<(SmolStr, Cid)>> {
        let mut walker = self.walk_leaves_from(prefix).await?;
        let mut out = Vec::new();
        while let Some((key, value)) = walker.next_leaf().await? {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// CIDs of the nodes on the path to `key`, plus the value CID if present
    pub fn cids_for_path<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Vec<Cid>> {
        Box::pin(async move {
            let mut cids = vec![self.get_pointer().await?];
            let entries = self.entries().await?;
            let idx = find_index(entries, key);
            if let Some(NodeEntry::Leaf { key: k, value }) = entries.get(idx) {
                if k == key {
                    cids.push(*value);
                    return Ok(cids);
                }
            }
            if let Some(subtree) = idx.checked_sub(1).and_then(|i| entries[i].as_tree()) {
                cids.extend(subtree.cids_for_path(key).await?);
            }
            Ok(cids)
        })
    }

    /// Every node block in the tree
    pub async fn all_nodes(&self) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        self.collect_nodes(&mut blocks, false).await?;
        Ok(blocks)
    }

    /// Node blocks created by mutations that are not yet in storage
    pub async fn unstored_blocks(&self) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        self.collect_nodes(&mut blocks, true).await?;
        Ok(blocks)
    }

    fn collect_nodes<'a>(&'a self, blocks: &'a mut BlockMap, skip_stored: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if skip_stored && self.node.stored {
                return Ok(());
            }
            let (cid, bytes) = self.to_block().await?;
            blocks.set(cid, bytes);
            for entry in self.entries().await? {
                if let NodeEntry::Tree(subtree) = entry {
                    subtree.collect_nodes(blocks, skip_stored).await?;
                }
            }
            Ok(())
        })
    }

    /// Write unstored nodes to `store` and return the root CID
    pub async fn write_to<R: RepoStore>(&self, store: &R) -> Result<Cid> {
        let blocks = self.unstored_blocks().await?;
        if !blocks.is_empty() {
            store.put_many(blocks).await?;
        }
        self.get_pointer().await
    }
}
