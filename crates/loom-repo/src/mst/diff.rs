//! Differences between two tree states

use super::node::NodeEntry;
use super::tree::Mst;
use crate::block::{BlockMap, CidSet};
use crate::error::Result;
use crate::repo::{RecordWriteDescript, WriteAction};
use crate::storage::BlockStore;
use crate::types::DataKey;
use cid::Cid;
use smol_str::SmolStr;
use std::collections::BTreeMap;

/// A key whose value changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffUpdate {
    /// Value before
    pub prev: Cid,
    /// Value after
    pub cid: Cid,
}

/// Everything that changed between two tree states.
///
/// Leaf changes are keyed by MST key. Block bookkeeping is what a store needs
/// to move from the old state to the new one: `new_mst_blocks` and
/// `new_leaf_cids` must be present afterwards, `removed_cids` may be dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDiff {
    /// Keys only in the new tree
    pub adds: BTreeMap<SmolStr, Cid>,
    /// Keys in both trees with different values
    pub updates: BTreeMap<SmolStr, DiffUpdate>,
    /// Keys only in the old tree
    pub deletes: BTreeMap<SmolStr, Cid>,

    /// Tree nodes that exist only in the new tree
    pub new_mst_blocks: BlockMap,
    /// Record CIDs referenced by added or updated keys
    pub new_leaf_cids: CidSet,
    /// Old tree nodes, and record CIDs no key in the new tree references
    pub removed_cids: CidSet,
}

/// Nodes of one side that still need visiting, bucketed by layer
struct Frontier<S> {
    by_layer: BTreeMap<usize, Vec<Mst<S>>>,
}

impl<S: BlockStore + 'static> Frontier<S> {
    async fn from_root(root: Option<&Mst<S>>) -> Result<Self> {
        let mut by_layer = BTreeMap::new();
        if let Some(root) = root {
            by_layer.insert(root.get_layer().await?, vec![root.clone()]);
        }
        Ok(Self { by_layer })
    }

    fn top(&self) -> Option<usize> {
        self.by_layer.keys().next_back().copied()
    }

    fn take(&mut self, layer: usize) -> Vec<Mst<S>> {
        self.by_layer.remove(&layer).unwrap_or_default()
    }

    fn push(&mut self, layer: usize, node: Mst<S>) {
        self.by_layer.entry(layer).or_default().push(node);
    }
}

impl DataDiff {
    /// Diff `curr` against `prev`; with no `prev` everything in `curr` is new.
    ///
    /// Both trees are walked from the top layer down. At each layer, nodes
    /// whose CID appears on both sides are identical subtrees and are dropped
    /// without loading. Only the remaining nodes are opened, so the cost is
    /// proportional to the size of the change rather than the size of the trees.
    /// The exception is a change that drops record CIDs: those are checked
    /// against every leaf of `curr` before being reported as removed.
    pub async fn of<S: BlockStore + 'static>(curr: &Mst<S>, prev: Option<&Mst<S>>) -> Result<Self> {
        let mut new_side = Frontier::from_root(Some(curr)).await?;
        let mut old_side = Frontier::from_root(prev).await?;
        let mut diff = DataDiff::default();
        let mut new_leaves = BTreeMap::new();
        let mut old_leaves = BTreeMap::new();

        while let Some(layer) = new_side.top().max(old_side.top()) {
            let new_nodes = new_side.take(layer);
            let old_nodes = old_side.take(layer);

            let mut new_cids = Vec::with_capacity(new_nodes.len());
            for node in &new_nodes {
                new_cids.push(node.get_pointer().await?);
            }
            let mut old_cids = Vec::with_capacity(old_nodes.len());
            for node in &old_nodes {
                old_cids.push(node.get_pointer().await?);
            }
            let shared: CidSet = new_cids
                .iter()
                .filter(|cid| old_cids.contains(cid))
                .copied()
                .collect();

            for (node, cid) in new_nodes.iter().zip(&new_cids) {
                if shared.contains(cid) {
                    continue;
                }
                let (cid, bytes) = node.to_block().await?;
                diff.new_mst_blocks.set(cid, bytes);
                for entry in node.entries().await? {
                    match entry {
                        NodeEntry::Leaf { key, value } => {
                            new_leaves.insert(key.clone(), *value);
                        }
                        NodeEntry::Tree(child) => new_side.push(layer.saturating_sub(1), child.clone()),
                    }
                }
            }

            for (node, cid) in old_nodes.iter().zip(&old_cids) {
                if shared.contains(cid) {
                    continue;
                }
                diff.removed_cids.insert(*cid);
                for entry in node.entries().await? {
                    match entry {
                        NodeEntry::Leaf { key, value } => {
                            old_leaves.insert(key.clone(), *value);
                        }
                        NodeEntry::Tree(child) => old_side.push(layer.saturating_sub(1), child.clone()),
                    }
                }
            }
        }

        let mut dropped_records = CidSet::new();
        for (key, cid) in &new_leaves {
            match old_leaves.remove(key) {
                None => {
                    diff.adds.insert(key.clone(), *cid);
                    diff.new_leaf_cids.insert(*cid);
                }
                Some(prev) if prev != *cid => {
                    diff.updates.insert(key.clone(), DiffUpdate { prev, cid: *cid });
                    diff.new_leaf_cids.insert(*cid);
                    dropped_records.insert(prev);
                }
                // moved between nodes without changing
                Some(_) => {}
            }
        }
        for (key, cid) in old_leaves {
            dropped_records.insert(cid);
            diff.deletes.insert(key, cid);
        }

        // A record block can back several keys, so it only goes once no key
        // in the new tree points at it.
        dropped_records.retain(|cid| !diff.new_leaf_cids.contains(cid));
        if !dropped_records.is_empty() {
            for (_, cid) in curr.leaves().await? {
                dropped_records.remove(&cid);
                if dropped_records.is_empty() {
                    break;
                }
            }
        }
        diff.removed_cids.extend(dropped_records);
        diff.removed_cids.retain(|cid| !diff.new_mst_blocks.has(cid));

        tracing::trace!(
            adds = diff.adds.len(),
            updates = diff.updates.len(),
            deletes = diff.deletes.len(),
            new_nodes = diff.new_mst_blocks.len(),
            "computed data diff"
        );
        Ok(diff)
    }

    /// No leaf changed
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Number of changed keys
    pub fn op_count(&self) -> usize {
        self.adds.len() + self.updates.len() + self.deletes.len()
    }

    /// Keys touched by the diff, in key order per kind
    pub fn updated_keys(&self) -> impl Iterator<Item = &SmolStr> {
        self.adds
            .keys()
            .chain(self.updates.keys())
            .chain(self.deletes.keys())
    }

    /// Describe the changes as record writes
    pub fn write_descripts(&self) -> Result<Vec<RecordWriteDescript>> {
        let mut out = Vec::with_capacity(self.op_count());
        for (key, cid) in &self.adds {
            out.push(RecordWriteDescript {
                action: WriteAction::Create,
                key: DataKey::parse(key)?,
                cid: Some(*cid),
                prev: None,
            });
        }
        for (key, update) in &self.updates {
            out.push(RecordWriteDescript {
                action: WriteAction::Update,
                key: DataKey::parse(key)?,
                cid: Some(update.cid),
                prev: Some(update.prev),
            });
        }
        for (key, cid) in &self.deletes {
            out.push(RecordWriteDescript {
                action: WriteAction::Delete,
                key: DataKey::parse(key)?,
                cid: None,
                prev: Some(*cid),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cid_for_bytes;
    use crate::storage::MemoryBlockStore;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn value(n: u32) -> Cid {
        cid_for_bytes(&n.to_be_bytes()).unwrap()
    }

    fn key(n: usize) -> String {
        format!("com.example.record/{:05}", n * 13)
    }

    async fn build(store: &Arc<MemoryBlockStore>, range: std::ops::Range<usize>) -> Mst<MemoryBlockStore> {
        Mst::from_leaves(store.clone(), range.map(|i| (key(i), value(i as u32))))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn identical_trees_have_empty_diff() {
        let store = Arc::new(MemoryBlockStore::new());
        let a = build(&store, 0..100).await;
        let b = build(&store, 0..100).await;
        let diff = DataDiff::of(&a, Some(&b)).await.unwrap();
        assert!(diff.is_empty());
        assert!(diff.new_mst_blocks.is_empty());
        assert!(diff.removed_cids.is_empty());
    }

    #[tokio::test]
    async fn against_nothing_everything_is_new() {
        let store = Arc::new(MemoryBlockStore::new());
        let tree = build(&store, 0..60).await;
        let diff = DataDiff::of(&tree, None).await.unwrap();

        assert_eq!(diff.adds.len(), 60);
        assert_eq!(diff.new_mst_blocks.len(), tree.all_nodes().await.unwrap().len());
        assert!(diff.removed_cids.is_empty());
    }

    #[tokio::test]
    async fn adds_updates_deletes() {
        let store = Arc::new(MemoryBlockStore::new());
        let old = build(&store, 0..80).await;

        let mut new = old.clone();
        for i in 80..90 {
            new = new.add(&key(i), value(i as u32)).await.unwrap();
        }
        for i in 10..15 {
            new = new.update(&key(i), value(1000 + i as u32)).await.unwrap();
        }
        for i in 40..48 {
            new = new.delete(&key(i)).await.unwrap();
        }

        let diff = DataDiff::of(&new, Some(&old)).await.unwrap();
        let adds: BTreeSet<_> = diff.adds.keys().map(|k| k.to_string()).collect();
        let updates: BTreeSet<_> = diff.updates.keys().map(|k| k.to_string()).collect();
        let deletes: BTreeSet<_> = diff.deletes.keys().map(|k| k.to_string()).collect();
        assert_eq!(adds, (80..90).map(key).collect());
        assert_eq!(updates, (10..15).map(key).collect());
        assert_eq!(deletes, (40..48).map(key).collect());

        assert_eq!(diff.updates[key(12).as_str()].prev, value(12));
        assert_eq!(diff.updates[key(12).as_str()].cid, value(1012));
        assert!(diff.new_leaf_cids.contains(&value(85)));
        assert!(diff.removed_cids.contains(&value(44)));
        assert!(diff.removed_cids.contains(&old.get_pointer().await.unwrap()));

        // Every new node is reachable from the new root, none from the old one.
        let new_nodes = new.all_nodes().await.unwrap();
        let old_nodes = old.all_nodes().await.unwrap();
        for (cid, _) in &diff.new_mst_blocks {
            assert!(new_nodes.has(cid));
            assert!(!old_nodes.has(cid));
        }
        // And together with the unchanged nodes they form the whole new tree.
        for (cid, _) in &new_nodes {
            assert!(diff.new_mst_blocks.has(cid) || old_nodes.has(cid));
        }
    }

    #[tokio::test]
    async fn shared_record_survives_delete_and_update() {
        let store = Arc::new(MemoryBlockStore::new());
        let shared = value(7);
        let old = Mst::from_leaves(
            store.clone(),
            (0..40).map(|i| (key(i), if i == 3 || i == 31 { shared } else { value(i as u32) })),
        )
        .await
        .unwrap();

        let deleted = old.delete(&key(3)).await.unwrap();
        let diff = DataDiff::of(&deleted, Some(&old)).await.unwrap();
        assert_eq!(diff.deletes[key(3).as_str()], shared);
        assert!(!diff.removed_cids.contains(&shared));

        let updated = old.update(&key(31), value(999)).await.unwrap();
        let diff = DataDiff::of(&updated, Some(&old)).await.unwrap();
        assert_eq!(diff.updates[key(31).as_str()].prev, shared);
        assert!(!diff.removed_cids.contains(&shared));

        // Once the last reference goes, so does the record.
        let both = deleted.delete(&key(31)).await.unwrap();
        let diff = DataDiff::of(&both, Some(&deleted)).await.unwrap();
        assert!(diff.removed_cids.contains(&shared));
    }

    #[tokio::test]
    async fn write_descripts_match_diff() {
        let store = Arc::new(MemoryBlockStore::new());
        let old = build(&store, 0..20).await;
        let new = old
            .add(&key(30), value(30))
            .await
            .unwrap()
            .delete(&key(3))
            .await
            .unwrap();
        let descripts = DataDiff::of(&new, Some(&old)).await.unwrap().write_descripts().unwrap();

        assert_eq!(descripts.len(), 2);
        let create = descripts.iter().find(|d| d.action == WriteAction::Create).unwrap();
        assert_eq!(create.key.collection(), "com.example.record");
        assert_eq!(create.cid, Some(value(30)));
        let delete = descripts.iter().find(|d| d.action == WriteAction::Delete).unwrap();
        assert_eq!(delete.prev, Some(value(3)));
        assert_eq!(delete.cid, None);
    }
}
