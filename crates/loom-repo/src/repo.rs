//! High-level repository operations
//!
//! A [`Repo`] is one signed snapshot: a commit plus the tree it points at.
//! Snapshots never change. Writing produces [`CommitData`] describing the
//! next snapshot, which is applied to storage in one step and loaded as a new
//! `Repo`. Older snapshots stay readable for as long as their blocks do.

use crate::block::{BlockMap, CidSet, cid_for_cbor};
use crate::commit::{Commit, UnsignedCommit};
use crate::crypto::Keypair;
use crate::error::{RepoError, Result};
use crate::mst::{DataDiff, Mst};
use crate::storage::{BlockStore, BlockStoreExt, RepoStore};
use crate::types::{DataKey, Did, Tid, TidClock, validate_collection};
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::{SmolStr, format_smolstr};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

static REV_CLOCK: LazyLock<TidClock> = LazyLock::new(TidClock::default);

/// Everything needed to move storage from one commit to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitData {
    /// Commit CID
    pub cid: Cid,

    /// New revision
    pub rev: Tid,

    /// Revision of the commit this one replaces (None for the first)
    pub since: Option<Tid>,

    /// CID of the commit this one replaces (None for the first)
    pub prev: Option<Cid>,

    /// Blocks to persist: new tree nodes, new records and the commit block
    pub new_blocks: BlockMap,

    /// Blocks a downstream consumer needs to check this transition.
    ///
    /// Covering proofs of every changed key in both the old and the new tree,
    /// the new records and the commit block.
    pub relevant_blocks: BlockMap,

    /// Blocks no longer referenced after this commit
    pub removed_cids: CidSet,
}

/// Kind of change made to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteAction {
    /// Record did not exist before
    Create,
    /// Record existed and now has a different value
    Update,
    /// Record existed and is gone
    Delete,
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        })
    }
}

/// A record change described by CIDs, as seen in a diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWriteDescript {
    /// What happened
    pub action: WriteAction,
    /// Which record
    pub key: DataKey,
    /// Value after, absent for deletes
    pub cid: Option<Cid>,
    /// Value before, absent for creates
    pub prev: Option<Cid>,
}

/// A requested record change
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWriteOp {
    /// Add a record. The key must not exist.
    Create {
        /// Record path
        key: DataKey,
        /// Record value, a CBOR map
        record: Ipld,
    },
    /// Replace a record. The key must exist.
    Update {
        /// Record path
        key: DataKey,
        /// New record value, a CBOR map
        record: Ipld,
    },
    /// Remove a record. The key must exist.
    Delete {
        /// Record path
        key: DataKey,
    },
}

impl RecordWriteOp {
    /// Record path this op touches
    pub fn key(&self) -> &DataKey {
        match self {
            RecordWriteOp::Create { key, .. }
            | RecordWriteOp::Update { key, .. }
            | RecordWriteOp::Delete { key } => key,
        }
    }

    /// Kind of change
    pub fn action(&self) -> WriteAction {
        match self {
            RecordWriteOp::Create { .. } => WriteAction::Create,
            RecordWriteOp::Update { .. } => WriteAction::Update,
            RecordWriteOp::Delete { .. } => WriteAction::Delete,
        }
    }
}

/// Collection name to record key to record value
pub type RepoContents = BTreeMap<SmolStr, BTreeMap<SmolStr, Ipld>>;

fn encode_record(key: &DataKey, record: &Ipld) -> Result<(Cid, Bytes)> {
    if !matches!(record, Ipld::Map(_)) {
        return Err(RepoError::invalid_commit(format!("record {} is not a map", key))
            .with_help("records are CBOR maps"));
    }
    cid_for_cbor(record).map_err(|e| e.with_context(format!("encoding record {}", key)))
}

/// Apply `writes` to `tree`, collecting the encoded record blocks
async fn apply_ops<S: RepoStore + 'static>(
    mut tree: Mst<S>,
    writes: &[RecordWriteOp],
) -> Result<(Mst<S>, BlockMap)> {
    let mut records = BlockMap::new();
    for write in writes {
        let key = write.key().to_key();
        tree = match write {
            RecordWriteOp::Create { key: path, record } => {
                let (cid, bytes) = encode_record(path, record)?;
                records.set(cid, bytes);
                tree.add(&key, cid).await?
            }
            RecordWriteOp::Update { key: path, record } => {
                let (cid, bytes) = encode_record(path, record)?;
                records.set(cid, bytes);
                tree.update(&key, cid).await?
            }
            RecordWriteOp::Delete { .. } => tree.delete(&key).await?,
        };
    }
    Ok((tree, records))
}

/// A signed repository snapshot
pub struct Repo<S> {
    storage: Arc<S>,
    data: Mst<S>,
    commit: Commit,
    cid: Cid,
}

impl<S> Clone for Repo<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            data: self.data.clone(),
            commit: self.commit.clone(),
            cid: self.cid,
        }
    }
}

impl<S> fmt::Debug for Repo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("did", self.commit.did())
            .field("cid", &self.cid)
            .field("rev", self.commit.rev())
            .field("data", &self.commit.data())
            .finish()
    }
}

impl<S: RepoStore + 'static> Repo<S> {
    /// Load the snapshot at `commit_cid`, or at the storage root when `None`.
    ///
    /// Only the commit block is read. Tree nodes load on demand.
    #[tracing::instrument(skip(storage))]
    pub async fn load(storage: Arc<S>, commit_cid: Option<Cid>) -> Result<Self> {
        let cid = match commit_cid {
            Some(cid) => cid,
            None => {
                storage
                    .root()
                    .await?
                    .ok_or_else(|| {
                        RepoError::invalid_commit("storage has no root commit")
                            .with_help("create the repository before loading it")
                    })?
                    .cid
            }
        };
        let bytes = storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::missing_block(cid, "commit"))?;
        let commit = Commit::from_cbor(&bytes)?;
        let data = Mst::load(storage.clone(), commit.data(), None);
        tracing::debug!(did = %commit.did(), rev = %commit.rev(), "loaded repo");

        Ok(Self {
            storage,
            data,
            commit,
            cid,
        })
    }

    /// Build the first commit of a repository without touching storage.
    ///
    /// `initial_writes` may only contain creates.
    pub async fn format_init_commit<K: Keypair + ?Sized>(
        storage: Arc<S>,
        did: Did<'static>,
        keypair: &K,
        initial_writes: &[RecordWriteOp],
    ) -> Result<CommitData> {
        if let Some(op) = initial_writes
            .iter()
            .find(|op| op.action() != WriteAction::Create)
        {
            return Err(RepoError::invalid_commit(format!(
                "initial commit can only create records, got {} on {}",
                op.action(),
                op.key()
            )));
        }

        let (tree, records) = apply_ops(Mst::new(storage), initial_writes).await?;
        let diff = DataDiff::of(&tree, None).await?;
        let data = tree.get_pointer().await?;

        let mut new_blocks = diff.new_mst_blocks;
        new_blocks.add_map(records);

        let rev = REV_CLOCK.next(None);
        let commit = UnsignedCommit::new(did, data, rev.clone(), None).sign(keypair)?;
        let (cid, bytes) = commit.to_block()?;
        new_blocks.set(cid, bytes);

        Ok(CommitData {
            cid,
            rev,
            since: None,
            prev: None,
            relevant_blocks: new_blocks.clone(),
            new_blocks,
            removed_cids: CidSet::new(),
        })
    }

    /// Create a repository in `storage` and return its first snapshot.
    ///
    /// Fails with `StaleRepo` if the storage already holds a repository.
    #[tracing::instrument(skip(storage, keypair, initial_writes), fields(writes = initial_writes.len()))]
    pub async fn create<K: Keypair + ?Sized>(
        storage: Arc<S>,
        did: Did<'static>,
        keypair: &K,
        initial_writes: &[RecordWriteOp],
    ) -> Result<Self> {
        let commit = Self::format_init_commit(storage.clone(), did, keypair, initial_writes).await?;
        storage.apply_commit(&commit).await?;
        Self::load(storage, Some(commit.cid)).await
    }

    /// Build the commit that applies `writes` on top of this snapshot.
    ///
    /// Nothing is written to storage and `self` is unchanged. The batch is
    /// all-or-nothing: any failing op fails the whole call.
    pub async fn format_commit<K: Keypair + ?Sized>(
        &self,
        writes: &[RecordWriteOp],
        keypair: &K,
    ) -> Result<CommitData> {
        let (tree, records) = apply_ops(self.data.clone(), writes).await?;
        let diff = DataDiff::of(&tree, Some(&self.data)).await?;
        let data = tree.get_pointer().await?;

        let mut new_blocks = diff.new_mst_blocks.clone();
        let mut relevant_blocks = BlockMap::new();
        for cid in &diff.new_leaf_cids {
            if let Some(bytes) = records.get(cid) {
                new_blocks.set(*cid, bytes.clone());
                relevant_blocks.set(*cid, bytes.clone());
            }
        }

        let keys: Vec<SmolStr> = writes.iter().map(|w| w.key().to_key()).collect();
        relevant_blocks.add_map(tree.covering_proofs(&keys).await?);
        relevant_blocks.add_map(self.data.covering_proofs(&keys).await?);

        let rev = REV_CLOCK.next(Some(self.commit.rev()));
        let commit = UnsignedCommit::new(self.commit.did().clone(), data, rev.clone(), Some(self.cid))
            .sign(keypair)?;
        let (cid, bytes) = commit.to_block()?;
        new_blocks.set(cid, bytes.clone());
        relevant_blocks.set(cid, bytes);

        tracing::debug!(
            ops = writes.len(),
            new_blocks = new_blocks.len(),
            removed = diff.removed_cids.len(),
            "formatted commit"
        );

        Ok(CommitData {
            cid,
            rev,
            since: Some(self.commit.rev().clone()),
            prev: Some(self.cid),
            new_blocks,
            relevant_blocks,
            removed_cids: diff.removed_cids,
        })
    }

    /// Persist `commit` and return the snapshot it creates.
    ///
    /// Fails with `StaleRepo` if storage has moved past the commit's `prev`.
    pub async fn apply_commit(&self, commit: CommitData) -> Result<Self> {
        self.storage.apply_commit(&commit).await?;
        Self::load(self.storage.clone(), Some(commit.cid)).await
    }

    /// Apply a batch of writes, sign, persist and return the new snapshot
    #[tracing::instrument(skip_all, fields(did = %self.did(), ops = writes.len()))]
    pub async fn apply_writes<K: Keypair + ?Sized>(
        &self,
        writes: &[RecordWriteOp],
        keypair: &K,
    ) -> Result<Self> {
        let commit = self.format_commit(writes, keypair).await?;
        self.apply_commit(commit).await
    }

    /// Decoded record at `collection`/`rkey`, `None` if absent
    pub async fn get_record(&self, collection: &str, rkey: &str) -> Result<Option<Ipld>> {
        match self.get_record_cid(collection, rkey).await? {
            Some(cid) => self.storage.read_record(&cid).await.map(Some),
            None => Ok(None),
        }
    }

    /// CID of the record at `collection`/`rkey`, `None` if absent
    pub async fn get_record_cid(&self, collection: &str, rkey: &str) -> Result<Option<Cid>> {
        let key = DataKey::new(collection, rkey)?;
        self.data.get(&key.to_key()).await
    }

    /// Record keys and CIDs in one collection, in key order
    pub async fn list_records(&self, collection: &str) -> Result<Vec<(SmolStr, Cid)>> {
        validate_collection(collection)?;
        let prefix = format_smolstr!("{}/", collection);
        let leaves = self.data.list_with_prefix(&prefix).await?;
        Ok(leaves
            .into_iter()
            .map(|(key, cid)| (SmolStr::new(&key[prefix.len()..]), cid))
            .collect())
    }

    /// Names of every collection holding at least one record
    pub async fn get_collections(&self) -> Result<Vec<SmolStr>> {
        let mut collections = Vec::new();
        let mut walker = self.data.walker().await?;
        while let Some((key, _)) = walker.next_leaf().await? {
            let key = DataKey::parse(&key)?;
            let collection = SmolStr::new(key.collection());
            // '0' is the byte after '/', so this skips the rest of the collection
            walker = self
                .data
                .walk_leaves_from(&format!("{}0", collection))
                .await?;
            collections.push(collection);
        }
        Ok(collections)
    }

    /// Every record, decoded.
    ///
    /// Record blocks are fetched in one batch; if any are missing this fails
    /// with `MissingBlocks` listing all of them.
    #[tracing::instrument(skip_all, fields(did = %self.did()))]
    pub async fn get_contents(&self) -> Result<RepoContents> {
        let leaves = self.data.leaves().await?;
        let cids: CidSet = leaves.iter().map(|(_, cid)| *cid).collect();
        let cids: Vec<Cid> = cids.into_iter().collect();
        let blocks = self.storage.get_blocks(&cids).await?;

        let mut contents = RepoContents::new();
        for (key, cid) in leaves {
            let bytes = blocks
                .get(&cid)
                .ok_or_else(|| RepoError::missing_block(cid, "record"))?;
            let record: Ipld = serde_ipld_dagcbor::from_slice(bytes)
                .map_err(|e| RepoError::unexpected_object(cid, "record", Some(Box::new(e))))?;
            if !matches!(record, Ipld::Map(_)) {
                return Err(RepoError::unexpected_object(cid, "record", None));
            }
            let key = DataKey::parse(&key)?;
            contents
                .entry(SmolStr::new(key.collection()))
                .or_default()
                .insert(SmolStr::new(key.rkey()), record);
        }
        Ok(contents)
    }

    /// Repository DID
    pub fn did(&self) -> &Did<'static> {
        self.commit.did()
    }

    /// Commit format version
    pub fn version(&self) -> i64 {
        self.commit.version()
    }

    /// Current revision
    pub fn rev(&self) -> &Tid {
        self.commit.rev()
    }

    /// CID of the commit this snapshot is at
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The signed commit
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// The record tree
    pub fn data(&self) -> &Mst<S> {
        &self.data
    }

    /// Backing storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoErrorKind;
    use crate::storage::MemoryBlockStore;
    use rand::rngs::OsRng;

    fn record(text: &str) -> Ipld {
        Ipld::Map(BTreeMap::from([(
            "text".to_string(),
            Ipld::String(text.to_string()),
        )]))
    }

    fn key(collection: &str, rkey: &str) -> DataKey {
        DataKey::new(collection, rkey).unwrap()
    }

    fn create(collection: &str, rkey: &str, text: &str) -> RecordWriteOp {
        RecordWriteOp::Create {
            key: key(collection, rkey),
            record: record(text),
        }
    }

    async fn empty_repo() -> (Repo<MemoryBlockStore>, k256::ecdsa::SigningKey) {
        let keypair = k256::ecdsa::SigningKey::random(&mut OsRng);
        let storage = Arc::new(MemoryBlockStore::new());
        let did = Did::new("did:example:alice").unwrap();
        let repo = Repo::create(storage, did, &keypair, &[]).await.unwrap();
        (repo, keypair)
    }

    #[tokio::test]
    async fn create_empty_and_load() {
        let (repo, keypair) = empty_repo().await;
        assert_eq!(repo.version(), 3);
        assert!(repo.commit().verify_sig(&keypair.did_key()).unwrap());
        assert_eq!(repo.commit().prev(), None);

        let loaded = Repo::load(repo.storage().clone(), None).await.unwrap();
        assert_eq!(loaded.cid(), repo.cid());
        assert_eq!(loaded.did().as_str(), "did:example:alice");
        assert!(loaded.get_contents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn initial_writes_are_creates_only() {
        let keypair = k256::ecdsa::SigningKey::random(&mut OsRng);
        let storage = Arc::new(MemoryBlockStore::new());
        let did = Did::new("did:example:alice").unwrap();

        let err = Repo::create(
            storage.clone(),
            did.clone(),
            &keypair,
            &[RecordWriteOp::Delete {
                key: key("com.example.posts", "a"),
            }],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidCommit);

        let repo = Repo::create(storage, did, &keypair, &[create("com.example.posts", "a", "hello")])
            .await
            .unwrap();
        assert_eq!(
            repo.get_record("com.example.posts", "a").await.unwrap(),
            Some(record("hello"))
        );
    }

    #[tokio::test]
    async fn writes_produce_new_snapshots() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(
                &[
                    create("com.example.posts", "a", "first"),
                    create("com.example.posts", "b", "second"),
                    create("com.example.likes", "x", "liked"),
                ],
                &keypair,
            )
            .await
            .unwrap();
        assert!(v2.rev().as_str() > v1.rev().as_str());
        assert_eq!(v2.commit().prev(), Some(v1.cid()));

        let v3 = v2
            .apply_writes(
                &[
                    RecordWriteOp::Update {
                        key: key("com.example.posts", "a"),
                        record: record("edited"),
                    },
                    RecordWriteOp::Delete {
                        key: key("com.example.likes", "x"),
                    },
                ],
                &keypair,
            )
            .await
            .unwrap();

        assert_eq!(v3.get_record("com.example.posts", "a").await.unwrap(), Some(record("edited")));
        assert_eq!(v3.get_record("com.example.likes", "x").await.unwrap(), None);

        let collections = v3.get_collections().await.unwrap();
        assert_eq!(collections, vec![SmolStr::new("com.example.posts")]);
        let listed: Vec<SmolStr> = v3
            .list_records("com.example.posts")
            .await
            .unwrap()
            .into_iter()
            .map(|(rkey, _)| rkey)
            .collect();
        assert_eq!(listed, vec![SmolStr::new("a"), SmolStr::new("b")]);
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(&[create("com.example.posts", "a", "first")], &keypair)
            .await
            .unwrap();
        let root_before = v2.storage().root().await.unwrap();

        let err = v2
            .apply_writes(
                &[
                    create("com.example.posts", "b", "fine"),
                    create("com.example.posts", "a", "duplicate"),
                ],
                &keypair,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::KeyExists);

        let err = v2
            .format_commit(
                &[RecordWriteOp::Update {
                    key: key("com.example.posts", "missing"),
                    record: record("nope"),
                }],
                &keypair,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::KeyNotFound);

        assert_eq!(v2.storage().root().await.unwrap(), root_before);
        assert_eq!(v2.get_record("com.example.posts", "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_snapshot_rejected() {
        let (v1, keypair) = empty_repo().await;
        // The next commit drops v1's root node from storage, so load it first.
        v1.data().leaves().await.unwrap();
        let _v2 = v1
            .apply_writes(&[create("com.example.posts", "a", "first")], &keypair)
            .await
            .unwrap();

        let err = v1
            .apply_writes(&[create("com.example.posts", "b", "late")], &keypair)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::StaleRepo);
    }

    #[tokio::test]
    async fn non_map_record_rejected() {
        let (repo, keypair) = empty_repo().await;
        let err = repo
            .apply_writes(
                &[RecordWriteOp::Create {
                    key: key("com.example.posts", "a"),
                    record: Ipld::String("not a map".into()),
                }],
                &keypair,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidCommit);
    }

    #[tokio::test]
    async fn relevant_blocks_prove_changed_keys() {
        let (v1, keypair) = empty_repo().await;
        let writes: Vec<RecordWriteOp> = (0..40)
            .map(|i| create("com.example.posts", &format!("{:04}", i), "seed"))
            .collect();
        let v2 = v1.apply_writes(&writes, &keypair).await.unwrap();

        let commit = v2
            .format_commit(&[create("com.example.posts", "0100", "new")], &keypair)
            .await
            .unwrap();
        let proof = Arc::new(MemoryBlockStore::from_blocks(commit.relevant_blocks.clone()));
        let new_commit = Commit::from_cbor(commit.relevant_blocks.get(&commit.cid).unwrap()).unwrap();

        let partial = Mst::load(proof, new_commit.data(), None);
        let found = partial.get("com.example.posts/0100").await.unwrap();
        assert!(found.is_some());
        assert!(commit.relevant_blocks.has(&found.unwrap()));
    }

    #[tokio::test]
    async fn missing_record_blocks_are_listed() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(
                &[
                    create("com.example.posts", "a", "one"),
                    create("com.example.posts", "b", "two"),
                ],
                &keypair,
            )
            .await
            .unwrap();

        let a = v2.get_record_cid("com.example.posts", "a").await.unwrap().unwrap();
        let b = v2.get_record_cid("com.example.posts", "b").await.unwrap().unwrap();
        let mut blocks = v2.storage().blocks();
        blocks.delete(&a);
        blocks.delete(&b);
        let stripped = Arc::new(MemoryBlockStore::from_blocks(blocks));
        let repo = Repo::load(stripped, Some(v2.cid())).await.unwrap();

        let err = repo.get_contents().await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::MissingBlocks);
        let mut missing = err.missing_cids().unwrap().to_vec();
        missing.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(missing, expected);
    }

    #[tokio::test]
    async fn removed_blocks_leave_storage() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(&[create("com.example.posts", "a", "gone soon")], &keypair)
            .await
            .unwrap();
        let record_cid = v2.get_record_cid("com.example.posts", "a").await.unwrap().unwrap();

        let v3 = v2
            .apply_writes(
                &[RecordWriteOp::Delete {
                    key: key("com.example.posts", "a"),
                }],
                &keypair,
            )
            .await
            .unwrap();
        assert!(!v3.storage().has(&record_cid).await.unwrap());
    }

    #[tokio::test]
    async fn shared_record_outlives_one_key() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(
                &[
                    create("com.example.posts", "a", "same text"),
                    create("com.example.posts", "b", "same text"),
                    create("com.example.posts", "c", "same text"),
                ],
                &keypair,
            )
            .await
            .unwrap();
        let shared = v2.get_record_cid("com.example.posts", "a").await.unwrap().unwrap();
        assert_eq!(v2.get_record_cid("com.example.posts", "b").await.unwrap(), Some(shared));

        let v3 = v2
            .apply_writes(
                &[RecordWriteOp::Delete {
                    key: key("com.example.posts", "a"),
                }],
                &keypair,
            )
            .await
            .unwrap();
        assert!(v3.storage().has(&shared).await.unwrap());
        assert_eq!(v3.get_record("com.example.posts", "b").await.unwrap(), Some(record("same text")));

        let v4 = v3
            .apply_writes(
                &[RecordWriteOp::Update {
                    key: key("com.example.posts", "b"),
                    record: record("edited"),
                }],
                &keypair,
            )
            .await
            .unwrap();
        assert!(v4.storage().has(&shared).await.unwrap());
        let contents = v4.get_contents().await.unwrap();
        assert_eq!(contents["com.example.posts"]["c"], record("same text"));
        assert_eq!(contents["com.example.posts"]["b"], record("edited"));
    }

    #[tokio::test]
    async fn shared_missing_record_listed_once() {
        let (v1, keypair) = empty_repo().await;
        let v2 = v1
            .apply_writes(
                &[
                    create("com.example.posts", "a", "twin"),
                    create("com.example.posts", "b", "twin"),
                ],
                &keypair,
            )
            .await
            .unwrap();
        let shared = v2.get_record_cid("com.example.posts", "a").await.unwrap().unwrap();
        let mut blocks = v2.storage().blocks();
        blocks.delete(&shared);
        let repo = Repo::load(Arc::new(MemoryBlockStore::from_blocks(blocks)), Some(v2.cid()))
            .await
            .unwrap();

        let err = repo.get_contents().await.unwrap_err();
        assert_eq!(err.missing_cids(), Some(&[shared][..]));
    }
}
