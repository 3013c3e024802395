//! Staged storage over a saved store
//!
//! Validating a remote commit needs the previous tree (already saved) plus
//! the incoming blocks, without writing those blocks anywhere permanent until
//! the commit checks out. [`SyncStorage`] reads from the staged layer first
//! and falls back to the saved one. All writes go to the staged layer.

use crate::block::BlockMap;
use crate::error::Result;
use crate::repo::CommitData;
use crate::storage::{BlockStore, RepoRoot, RepoStore};
use crate::types::Tid;
use bytes::Bytes;
use cid::Cid;
use std::sync::Arc;

/// Staged blocks layered over saved storage
#[derive(Debug, Clone)]
pub struct SyncStorage<Staged, Saved> {
    staged: Staged,
    saved: Arc<Saved>,
}

impl<Staged: BlockStore, Saved: BlockStore> SyncStorage<Staged, Saved> {
    /// Layer `staged` over `saved`
    pub fn new(staged: Staged, saved: Arc<Saved>) -> Self {
        Self { staged, saved }
    }

    /// The layer receiving writes
    pub fn staged(&self) -> &Staged {
        &self.staged
    }

    /// The read-only fallback layer
    pub fn saved(&self) -> &Arc<Saved> {
        &self.saved
    }
}

impl<Staged: BlockStore + 'static, Saved: BlockStore + 'static> BlockStore
    for SyncStorage<Staged, Saved>
{
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if let Some(bytes) = self.staged.get(cid).await? {
            return Ok(Some(bytes));
        }
        self.saved.get(cid).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        if self.staged.has(cid).await? {
            return Ok(true);
        }
        self.saved.has(cid).await
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<(BlockMap, Vec<Cid>)> {
        let (mut found, missing) = self.staged.get_many(cids).await?;
        if missing.is_empty() {
            return Ok((found, missing));
        }
        let (from_saved, missing) = self.saved.get_many(&missing).await?;
        found.add_map(from_saved);
        Ok((found, missing))
    }
}

impl<Staged: RepoStore + 'static, Saved: BlockStore + 'static> RepoStore
    for SyncStorage<Staged, Saved>
{
    async fn put(&self, data: &[u8]) -> Result<Cid> {
        self.staged.put(data).await
    }

    async fn put_block(&self, cid: Cid, bytes: Bytes) -> Result<()> {
        self.staged.put_block(cid, bytes).await
    }

    async fn put_many(&self, blocks: BlockMap) -> Result<()> {
        self.staged.put_many(blocks).await
    }

    async fn root(&self) -> Result<Option<RepoRoot>> {
        self.staged.root().await
    }

    async fn update_root(&self, cid: Cid, rev: Tid) -> Result<()> {
        self.staged.update_root(cid, rev).await
    }

    async fn apply_commit(&self, commit: &CommitData) -> Result<()> {
        self.staged.apply_commit(commit).await
    }
}
