//! In-memory block storage

use crate::block::{BlockMap, cid_for_bytes};
use crate::error::{RepoError, Result};
use crate::repo::CommitData;
use crate::storage::{BlockStore, RepoRoot, RepoStore};
use crate::types::Tid;
use bytes::Bytes;
use cid::Cid;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory block storage
///
/// Useful for:
/// - Testing
/// - Staging blocks while validating a remote commit
/// - Small repositories that fit in memory
///
/// Blocks and the root pointer sit under one lock, so a commit is applied
/// in a single critical section. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BlockMap,
    root: Option<RepoRoot>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `blocks`
    pub fn from_blocks(blocks: BlockMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner { blocks, root: None })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.read().blocks.is_empty()
    }

    /// Copy of every block currently held
    pub fn blocks(&self) -> BlockMap {
        self.read().blocks.clone()
    }

    /// Clear all blocks and the root
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.blocks = BlockMap::new();
        inner.root = None;
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.read().blocks.get(cid).cloned())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.read().blocks.has(cid))
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<(BlockMap, Vec<Cid>)> {
        Ok(self.read().blocks.get_many(cids))
    }
}

impl RepoStore for MemoryBlockStore {
    async fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = cid_for_bytes(data)?;
        self.write().blocks.set(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn put_block(&self, cid: Cid, bytes: Bytes) -> Result<()> {
        self.write().blocks.set(cid, bytes);
        Ok(())
    }

    async fn put_many(&self, blocks: BlockMap) -> Result<()> {
        self.write().blocks.add_map(blocks);
        Ok(())
    }

    async fn root(&self) -> Result<Option<RepoRoot>> {
        Ok(self.read().root.clone())
    }

    async fn update_root(&self, cid: Cid, rev: Tid) -> Result<()> {
        self.write().root = Some(RepoRoot { cid, rev });
        Ok(())
    }

    async fn apply_commit(&self, commit: &CommitData) -> Result<()> {
        let mut inner = self.write();
        let current = inner.root.as_ref().map(|r| r.cid);
        if current.is_some() && current != commit.prev {
            return Err(RepoError::stale(commit.prev, current));
        }

        inner.blocks.extend_from(&commit.new_blocks);
        for cid in &commit.removed_cids {
            if !commit.new_blocks.has(cid) {
                inner.blocks.delete(cid);
            }
        }
        inner.root = Some(RepoRoot {
            cid: commit.cid,
            rev: commit.rev.clone(),
        });
        tracing::debug!(commit = %commit.cid, rev = %commit.rev, "applied commit to memory store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CidSet;

    fn commit(cid: Cid, prev: Option<Cid>, new_blocks: BlockMap, removed: CidSet) -> CommitData {
        CommitData {
            cid,
            rev: Tid::now_0(),
            since: None,
            prev,
            new_blocks,
            relevant_blocks: BlockMap::new(),
            removed_cids: removed,
        }
    }

    #[tokio::test]
    async fn put_get_has() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"test data").await.unwrap();

        assert_eq!(store.get(&cid).await.unwrap().as_deref(), Some(&b"test data"[..]));
        assert!(store.has(&cid).await.unwrap());
        assert!(!store.has(&cid_for_bytes(b"other").unwrap()).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_many_splits_missing() {
        let store = MemoryBlockStore::new();
        let a = store.put(b"a").await.unwrap();
        let b = cid_for_bytes(b"b").unwrap();

        let (found, missing) = store.get_many(&[a, b]).await.unwrap();
        assert!(found.has(&a));
        assert_eq!(missing, vec![b]);
    }

    #[tokio::test]
    async fn apply_commit_swaps_blocks_and_root() {
        let store = MemoryBlockStore::new();
        let old = store.put(b"old node").await.unwrap();

        let mut new_blocks = BlockMap::new();
        let first = new_blocks.add("commit one").unwrap();
        store
            .apply_commit(&commit(first, None, new_blocks, CidSet::from([old])))
            .await
            .unwrap();
        assert!(!store.has(&old).await.unwrap());
        assert_eq!(store.root().await.unwrap().map(|r| r.cid), Some(first));

        let mut new_blocks = BlockMap::new();
        let second = new_blocks.add("commit two").unwrap();
        store
            .apply_commit(&commit(second, Some(first), new_blocks, CidSet::new()))
            .await
            .unwrap();
        assert_eq!(store.root().await.unwrap().map(|r| r.cid), Some(second));
    }

    #[tokio::test]
    async fn stale_commit_rejected() {
        let store = MemoryBlockStore::new();
        let mut blocks = BlockMap::new();
        let head = blocks.add("head").unwrap();
        store.apply_commit(&commit(head, None, blocks, CidSet::new())).await.unwrap();

        // Built on nothing, but the store already has a head.
        let mut blocks = BlockMap::new();
        let other = blocks.add("other").unwrap();
        let err = store
            .apply_commit(&commit(other, None, blocks, CidSet::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::StaleRepo);
        assert!(!store.has(&other).await.unwrap());
        assert_eq!(store.root().await.unwrap().map(|r| r.cid), Some(head));
    }

    #[tokio::test]
    async fn removed_cids_kept_when_readded() {
        let store = MemoryBlockStore::new();
        let mut blocks = BlockMap::new();
        let shared = blocks.add("shared").unwrap();
        let head = cid_for_bytes(b"head").unwrap();
        store
            .apply_commit(&commit(head, None, blocks, CidSet::from([shared])))
            .await
            .unwrap();
        assert!(store.has(&shared).await.unwrap());
    }
}
