//! Repository storage backed by a single CAR file
//!
//! The whole repository is held in memory and written back as one CAR whose
//! root is the head commit. Every commit rewrites the file through a
//! temporary sibling and a rename, so a crash leaves either the old file or
//! the new one.

use crate::block::{BlockMap, cid_for_bytes};
use crate::car::{CarReadOptions, read_car_file, write_car_file};
use crate::commit::Commit;
use crate::error::{RepoError, Result};
use crate::repo::CommitData;
use crate::storage::{BlockStore, RepoRoot, RepoStore};
use crate::types::Tid;
use bytes::Bytes;
use cid::Cid;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// CAR-file-backed repository store
///
/// Reads are served from memory. [`apply_commit`](RepoStore::apply_commit)
/// and [`update_root`](RepoStore::update_root) persist before returning.
/// Loose puts are held until the next commit or [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct CarFileStore {
    path: PathBuf,
    state: Arc<RwLock<Inner>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BlockMap,
    root: Option<RepoRoot>,
    dirty: bool,
}

impl CarFileStore {
    fn with_state(path: PathBuf, inner: Inner) -> Self {
        Self {
            path,
            state: Arc::new(RwLock::new(inner)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Start an empty store that will persist to `path`.
    ///
    /// Nothing is written until the store has a head, since a CAR needs a
    /// root to be readable.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if tokio::fs::try_exists(&path).await? {
            return Err(RepoError::io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ))
            .with_help("open it with CarFileStore::load instead"));
        }
        Ok(Self::with_state(path, Inner::default()))
    }

    /// Open an existing CAR file, taking its first root as the head commit
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = read_car_file(&path, CarReadOptions::default()).await?;

        let root = match contents.root() {
            Some(cid) => {
                let bytes = contents
                    .blocks
                    .get(&cid)
                    .ok_or_else(|| RepoError::missing_block(cid, "commit"))?;
                let commit = Commit::from_cbor(bytes)?;
                Some(RepoRoot {
                    cid,
                    rev: commit.rev().clone(),
                })
            }
            None => None,
        };
        tracing::debug!(blocks = contents.blocks.len(), has_root = root.is_some(), "loaded CAR store");

        Ok(Self::with_state(
            path,
            Inner {
                blocks: contents.blocks,
                root,
                dirty: false,
            },
        ))
    }

    /// File this store persists to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether loose puts are waiting to be written
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, root: Option<Cid>, blocks: BlockMap) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_car_file(&tmp, root, blocks).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Write held blocks to disk.
    ///
    /// A store without a head keeps its blocks in memory until the first
    /// commit or root update.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let (root, blocks) = {
            let inner = self.read();
            let Some(root) = inner.root.as_ref().filter(|_| inner.dirty) else {
                return Ok(());
            };
            (Some(root.cid), inner.blocks.clone())
        };
        self.persist(root, blocks).await?;
        self.write().dirty = false;
        Ok(())
    }
}

impl BlockStore for CarFileStore {
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

impl RepoStore for CarFileStore {
    async fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = cid_for_bytes(data)?;
        self.put_block(cid, Bytes::copy_from_slice(data)).await?;
        Ok(cid)
    }

    async fn put_block(&self, cid: Cid, bytes: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut inner = self.write();
        inner.blocks.set(cid, bytes);
        inner.dirty = true;
        Ok(())
    }

    async fn put_many(&self, blocks: BlockMap) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut inner = self.write();
        inner.blocks.add_map(blocks);
        inner.dirty = true;
        Ok(())
    }

    async fn root(&self) -> Result<Option<RepoRoot>> {
        Ok(self.read().root.clone())
    }

    async fn update_root(&self, cid: Cid, rev: Tid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let blocks = self.read().blocks.clone();
        self.persist(Some(cid), blocks).await?;

        let mut inner = self.write();
        inner.root = Some(RepoRoot { cid, rev });
        inner.dirty = false;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(commit = %commit.cid, rev = %commit.rev))]
    async fn apply_commit(&self, commit: &CommitData) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let blocks = {
            let inner = self.read();
            let current = inner.root.as_ref().map(|r| r.cid);
            if current.is_some() && current != commit.prev {
                return Err(RepoError::stale(commit.prev, current));
            }
            let mut blocks = inner.blocks.clone();
            blocks.extend_from(&commit.new_blocks);
            for cid in &commit.removed_cids {
                if !commit.new_blocks.has(cid) {
                    blocks.delete(cid);
                }
            }
            blocks
        };

        self.persist(Some(commit.cid), blocks.clone()).await?;

        let mut inner = self.write();
        inner.blocks = blocks;
        inner.root = Some(RepoRoot {
            cid: commit.cid,
            rev: commit.rev.clone(),
        });
        inner.dirty = false;
        tracing::debug!("persisted commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CidSet;
    use crate::commit::UnsignedCommit;
    use crate::types::{Did, TidExt};

    fn signed_commit(rev: Tid, prev: Option<Cid>) -> (Cid, Bytes, Tid) {
        let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let commit = UnsignedCommit::new(
            Did::new("did:example:file").unwrap(),
            cid_for_bytes(b"tree").unwrap(),
            rev.clone(),
            prev,
        )
        .sign(&key)
        .unwrap();
        let (cid, bytes) = commit.to_block().unwrap();
        (cid, bytes, rev)
    }

    fn commit_data(cid: Cid, bytes: Bytes, rev: Tid, prev: Option<Cid>, removed: CidSet) -> CommitData {
        let mut new_blocks = BlockMap::new();
        new_blocks.set(cid, bytes);
        CommitData {
            cid,
            rev,
            since: None,
            prev,
            new_blocks,
            relevant_blocks: BlockMap::new(),
            removed_cids: removed,
        }
    }

    #[tokio::test]
    async fn commits_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        let store = CarFileStore::create(&path).await.unwrap();
        assert_eq!(store.root().await.unwrap(), None);

        let (cid, bytes, rev) = signed_commit(Tid::from_micros(1_000, 0), None);
        store
            .apply_commit(&commit_data(cid, bytes, rev.clone(), None, CidSet::new()))
            .await
            .unwrap();

        let reopened = CarFileStore::load(&path).await.unwrap();
        assert_eq!(reopened.root().await.unwrap(), Some(RepoRoot { cid, rev }));
        assert!(reopened.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn loose_puts_wait_for_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        let store = CarFileStore::create(&path).await.unwrap();
        let (head, bytes, rev) = signed_commit(Tid::from_micros(1_000, 0), None);
        store
            .apply_commit(&commit_data(head, bytes, rev, None, CidSet::new()))
            .await
            .unwrap();

        let cid = store.put(b"loose").await.unwrap();
        assert!(store.is_dirty());
        assert!(!CarFileStore::load(&path).await.unwrap().has(&cid).await.unwrap());

        store.flush().await.unwrap();
        assert!(!store.is_dirty());
        assert!(CarFileStore::load(&path).await.unwrap().has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn stale_commit_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        let store = CarFileStore::create(&path).await.unwrap();

        let (head, bytes, rev) = signed_commit(Tid::from_micros(1_000, 0), None);
        store
            .apply_commit(&commit_data(head, bytes, rev, None, CidSet::new()))
            .await
            .unwrap();

        let (other, bytes, rev) = signed_commit(Tid::from_micros(2_000, 0), None);
        let err = store
            .apply_commit(&commit_data(other, bytes, rev, None, CidSet::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::StaleRepo);

        let reopened = CarFileStore::load(&path).await.unwrap();
        assert_eq!(reopened.root().await.unwrap().map(|r| r.cid), Some(head));
        assert!(!reopened.has(&other).await.unwrap());
    }

    #[tokio::test]
    async fn headless_store_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        let store = CarFileStore::create(&path).await.unwrap();
        store.put(b"early").await.unwrap();
        store.flush().await.unwrap();
        assert!(store.is_dirty());
        assert!(!tokio::fs::try_exists(&path).await.unwrap());

        assert!(CarFileStore::create(&path).await.is_ok());
        let (head, bytes, rev) = signed_commit(Tid::from_micros(1_000, 0), None);
        store
            .apply_commit(&commit_data(head, bytes, rev, None, CidSet::new()))
            .await
            .unwrap();
        let err = CarFileStore::create(&path).await.unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::Io);
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CarFileStore::load(dir.path().join("absent.car")).await.unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::Io);
    }
}
