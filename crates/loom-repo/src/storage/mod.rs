//! Block storage abstraction for tree nodes, commits and records

use crate::block::BlockMap;
use crate::error::{RepoError, Result};
use crate::repo::CommitData;
use crate::types::Tid;
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use serde::de::DeserializeOwned;
use std::future::Future;

pub mod file;
pub mod memory;
pub mod sync;

pub use file::CarFileStore;
pub use memory::MemoryBlockStore;
pub use sync::SyncStorage;

/// Readable block storage.
///
/// Provides CID-keyed reads of tree nodes, commits and record data.
/// Implementations might be:
/// - an in-memory map ([`MemoryBlockStore`])
/// - a CAR file ([`CarFileStore`])
/// - a staged overlay on another store ([`SyncStorage`])
/// - a database or remote store (user-provided)
///
/// Clone is required so trees can share storage handles across operations.
#[trait_variant::make(Send)]
pub trait BlockStore: Clone + Send + Sync {
    /// Get a block by CID, `None` if it is not here
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Check for a block without reading it
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Fetch several blocks, splitting them into found blocks and missing CIDs.
    ///
    /// Missing blocks are not an error here; callers decide what absence means.
    async fn get_many(&self, cids: &[Cid]) -> Result<(BlockMap, Vec<Cid>)>;
}

/// Current head of a repository in a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRoot {
    /// Commit CID
    pub cid: Cid,
    /// Revision of that commit
    pub rev: Tid,
}

/// Writable storage holding one repository.
///
/// [`RepoStore::apply_commit`] is the mutation boundary for commits. It must
/// make the new blocks and the new root visible together to concurrent
/// readers.
#[trait_variant::make(Send)]
pub trait RepoStore: BlockStore {
    /// Store DAG-CBOR bytes, returning their CID
    async fn put(&self, data: &[u8]) -> Result<Cid>;

    /// Store a block under a known CID
    async fn put_block(&self, cid: Cid, bytes: Bytes) -> Result<()>;

    /// Store many blocks at once
    async fn put_many(&self, blocks: BlockMap) -> Result<()>;

    /// Current repository head, if one has been set
    async fn root(&self) -> Result<Option<RepoRoot>>;

    /// Point the repository at a commit without any other change
    async fn update_root(&self, cid: Cid, rev: Tid) -> Result<()>;

    /// Atomically add `new_blocks`, drop `removed_cids` and move the root.
    ///
    /// When the store already has a root, `commit.prev` must name it.
    /// Otherwise the commit was built from a stale snapshot and is rejected
    /// with `StaleRepo` without changing anything.
    async fn apply_commit(&self, commit: &CommitData) -> Result<()>;
}

/// Typed read helpers available on every [`BlockStore`]
pub trait BlockStoreExt: BlockStore {
    /// Read and decode a DAG-CBOR block.
    ///
    /// Fails with `MissingBlocks` if absent and `UnexpectedObject` if it does
    /// not decode as `T`.
    fn read_obj<T: DeserializeOwned + Send>(&self, cid: &Cid) -> impl Future<Output = Result<T>> + Send;

    /// Like [`read_obj`](Self::read_obj), also returning the raw bytes
    fn read_obj_and_bytes<T: DeserializeOwned + Send>(
        &self,
        cid: &Cid,
    ) -> impl Future<Output = Result<(T, Bytes)>> + Send;

    /// Like [`read_obj`](Self::read_obj), but absence is `Ok(None)`
    fn attempt_read<T: DeserializeOwned + Send>(
        &self,
        cid: &Cid,
    ) -> impl Future<Output = Result<Option<T>>> + Send;

    /// Read a record block, which must decode to a CBOR map
    fn read_record(&self, cid: &Cid) -> impl Future<Output = Result<Ipld>> + Send;

    /// Fetch every block in `cids`, failing with all missing CIDs if any are absent
    fn get_blocks(&self, cids: &[Cid]) -> impl Future<Output = Result<BlockMap>> + Send;
}

fn decode<T: DeserializeOwned>(cid: &Cid, bytes: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| RepoError::unexpected_object(*cid, std::any::type_name::<T>(), Some(Box::new(e))))
}

impl<S: BlockStore> BlockStoreExt for S {
    fn read_obj<T: DeserializeOwned + Send>(&self, cid: &Cid) -> impl Future<Output = Result<T>> + Send {
        async move { self.read_obj_and_bytes(cid).await.map(|(obj, _)| obj) }
    }

    fn read_obj_and_bytes<T: DeserializeOwned + Send>(
        &self,
        cid: &Cid,
    ) -> impl Future<Output = Result<(T, Bytes)>> + Send {
        async move {
            let bytes = self
                .get(cid)
                .await?
                .ok_or_else(|| RepoError::missing_block(*cid, std::any::type_name::<T>()))?;
            let obj = decode(cid, &bytes)?;
            Ok((obj, bytes))
        }
    }

    fn attempt_read<T: DeserializeOwned + Send>(
        &self,
        cid: &Cid,
    ) -> impl Future<Output = Result<Option<T>>> + Send {
        async move {
            match self.get(cid).await? {
                Some(bytes) => decode(cid, &bytes).map(Some),
                None => Ok(None),
            }
        }
    }

    fn read_record(&self, cid: &Cid) -> impl Future<Output = Result<Ipld>> + Send {
        async move {
            let bytes = self
                .get(cid)
                .await?
                .ok_or_else(|| RepoError::missing_block(*cid, "record"))?;
            match decode::<Ipld>(cid, &bytes)? {
                record @ Ipld::Map(_) => Ok(record),
                _ => Err(RepoError::unexpected_object(*cid, "record", None)
                    .with_help("records are CBOR maps")),
            }
        }
    }

    fn get_blocks(&self, cids: &[Cid]) -> impl Future<Output = Result<BlockMap>> + Send {
        async move {
            let (blocks, missing) = self.get_many(cids).await?;
            if !missing.is_empty() {
                return Err(RepoError::missing_blocks("record", missing));
            }
            Ok(blocks)
        }
    }
}

impl<S: BlockStore> BlockStore for std::sync::Arc<S> {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        self.as_ref().get(cid).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.as_ref().has(cid).await
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<(BlockMap, Vec<Cid>)> {
        self.as_ref().get_many(cids).await
    }
}
