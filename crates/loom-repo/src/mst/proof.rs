//! Covering proofs for individual keys

use super::BoxFuture;
use super::node::NodeEntry;
use super::tree::Mst;
use super::util::find_gt_or_equal_leaf_index;
use crate::block::BlockMap;
use crate::error::Result;
use crate::storage::BlockStore;

#[derive(Clone, Copy)]
enum Edge {
    Left,
    Right,
}

impl<S: BlockStore + 'static> Mst<S> {
    /// Node blocks that prove the value (or absence) of `key`.
    ///
    /// The proof holds every node from the root down to the node where the
    /// search for `key` ends. Subtrees hanging off that path are referenced
    /// by CID only. When the key is present, the proof also carries the
    /// rightmost spine of the subtree just before it and the leftmost spine
    /// of the subtree just after it: deleting the key merges those two
    /// subtrees along exactly those spines.
    ///
    /// With these blocks a verifier can look the key up, and can also add,
    /// update or delete that one key and recompute the new root without any
    /// other part of the tree.
    pub async fn covering_proof(&self, key: &str) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        self.prove_into(key, &mut blocks).await?;
        Ok(blocks)
    }

    /// Union of the covering proofs of several keys
    pub async fn covering_proofs<K: AsRef<str>>(&self, keys: impl IntoIterator<Item = K>) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        for key in keys {
            self.prove_into(key.as_ref(), &mut blocks).await?;
        }
        Ok(blocks)
    }

    fn prove_into<'a>(&'a self, key: &'a str, blocks: &'a mut BlockMap) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let (cid, bytes) = self.to_block().await?;
            blocks.set(cid, bytes);

            let entries = self.entries().await?;
            let idx = find_gt_or_equal_leaf_index(entries, key);
            let prev = idx.checked_sub(1).and_then(|i| entries[i].as_tree());

            if entries.get(idx).and_then(NodeEntry::leaf_key) == Some(key) {
                if let Some(prev) = prev {
                    prev.spine_into(Edge::Right, blocks).await?;
                }
                if let Some(next) = entries.get(idx + 1).and_then(NodeEntry::as_tree) {
                    next.spine_into(Edge::Left, blocks).await?;
                }
                return Ok(());
            }
            match prev {
                Some(subtree) => subtree.prove_into(key, blocks).await,
                None => Ok(()),
            }
        })
    }

    fn spine_into<'a>(&'a self, edge: Edge, blocks: &'a mut BlockMap) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let (cid, bytes) = self.to_block().await?;
            blocks.set(cid, bytes);
            let entries = self.entries().await?;
            let outer = match edge {
                Edge::Left => entries.first(),
                Edge::Right => entries.last(),
            };
            match outer {
                Some(NodeEntry::Tree(subtree)) => subtree.spine_into(edge, blocks).await,
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cid_for_bytes;
    use crate::storage::{MemoryBlockStore, RepoStore};
    use cid::Cid;
    use std::sync::Arc;

    fn value(n: u32) -> Cid {
        cid_for_bytes(&n.to_be_bytes()).unwrap()
    }

    fn key(n: usize) -> String {
        format!("com.example.record/{:04}", n)
    }

    async fn proof_store(proof: BlockMap) -> Arc<MemoryBlockStore> {
        let store = Arc::new(MemoryBlockStore::new());
        store.put_many(proof).await.unwrap();
        store
    }

    #[tokio::test]
    async fn proof_is_sufficient_for_lookup() {
        let tree = Mst::from_leaves(
            Arc::new(MemoryBlockStore::new()),
            (0..300).map(|i| (key(i), value(i as u32))),
        )
        .await
        .unwrap();
        let root = tree.get_pointer().await.unwrap();

        for i in [0, 7, 150, 299] {
            let proof = tree.covering_proof(&key(i)).await.unwrap();
            assert!(proof.len() < tree.all_nodes().await.unwrap().len());
            let partial = Mst::load(proof_store(proof).await, root, None);
            assert_eq!(partial.get(&key(i)).await.unwrap(), Some(value(i as u32)));
        }

        // Absence is provable too.
        let absent = "com.example.record/0150a";
        let proof = tree.covering_proof(absent).await.unwrap();
        let partial = Mst::load(proof_store(proof).await, root, None);
        assert_eq!(partial.get(absent).await.unwrap(), None);
    }

    #[tokio::test]
    async fn proof_supports_replaying_one_write() {
        let full = Mst::from_leaves(
            Arc::new(MemoryBlockStore::new()),
            (0..200).map(|i| (key(i), value(i as u32))),
        )
        .await
        .unwrap();
        let root = full.get_pointer().await.unwrap();

        for i in [3, 64, 100, 199] {
            let k = key(i);
            let partial = Mst::load(proof_store(full.covering_proof(&k).await.unwrap()).await, root, None);

            let deleted = partial.delete(&k).await.unwrap();
            let expected = full.delete(&k).await.unwrap();
            assert_eq!(deleted.get_pointer().await.unwrap(), expected.get_pointer().await.unwrap());

            let updated = partial.update(&k, value(9999)).await.unwrap();
            let expected = full.update(&k, value(9999)).await.unwrap();
            assert_eq!(updated.get_pointer().await.unwrap(), expected.get_pointer().await.unwrap());
        }

        let new_key = "com.example.record/0042x";
        let partial = Mst::load(
            proof_store(full.covering_proof(new_key).await.unwrap()).await,
            root,
            None,
        );
        let added = partial.add(new_key, value(1)).await.unwrap();
        let expected = full.add(new_key, value(1)).await.unwrap();
        assert_eq!(added.get_pointer().await.unwrap(), expected.get_pointer().await.unwrap());
    }
}
