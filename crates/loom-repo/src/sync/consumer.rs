//! Verifying repositories, diffs and record proofs received from elsewhere
//!
//! Everything here trusts only two inputs from the caller: the DID the data
//! should belong to and the `did:key` that DID signs with. All other state
//! is rebuilt from the supplied blocks and checked against the signed commit.

use crate::block::{BlockMap, CidSet};
use crate::car::{CarReadOptions, read_car_bytes};
use crate::commit::Commit;
use crate::error::{CarError, RepoError, Result, VerificationError};
use crate::mst::{BoxFuture, DataDiff, Mst, NodeEntry};
use crate::repo::{CommitData, RecordWriteDescript, Repo, RepoContents};
use crate::storage::{BlockStore, MemoryBlockStore, RepoStore, SyncStorage};
use crate::types::{DataKey, Did};
use bytes::Bytes;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use std::sync::Arc;

/// Options for full-repository and diff verification
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
#[builder(start_fn = new)]
pub struct VerifyOptions {
    /// Require the record block of every new leaf to be present
    #[builder(default = true)]
    pub ensure_leaves: bool,

    /// How the CAR itself is decoded
    #[builder(default)]
    pub car: CarReadOptions,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// A statement about the value of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordClaim {
    /// Collection NSID
    pub collection: SmolStr,
    /// Record key
    pub rkey: SmolStr,
    /// `Some(cid)` claims the record exists with that CID, `None` claims it does not
    pub cid: Option<Cid>,
}

impl RecordClaim {
    /// Claim about `collection`/`rkey`
    pub fn new(collection: impl AsRef<str>, rkey: impl AsRef<str>, cid: Option<Cid>) -> Self {
        Self {
            collection: SmolStr::new(collection),
            rkey: SmolStr::new(rkey),
            cid,
        }
    }
}

/// Outcome of [`verify_proofs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyProofsOutput {
    /// Claims the proof establishes
    pub verified: Vec<RecordClaim>,
    /// Claims the proof contradicts or cannot decide
    pub unverified: Vec<RecordClaim>,
}

/// A fully checked repository
#[derive(Debug, Clone)]
pub struct VerifiedRepo {
    /// Commit data that would install this repository into empty storage
    pub commit: CommitData,
    /// Every record, as creates against an empty repository
    pub creates: Vec<RecordWriteDescript>,
    /// Decoded records
    pub records: RepoContents,
}

/// A checked transition from a trusted repository to a new commit
#[derive(Debug, Clone)]
pub struct VerifiedDiff {
    /// Record changes made by the new commit
    pub writes: Vec<RecordWriteDescript>,
    /// Commit data ready for [`Repo::apply_commit`]
    pub commit: CommitData,
}

/// Decode the commit at `cid`, check it belongs to `did` and is signed by `did_key`
pub fn verify_commit_block(blocks: &BlockMap, cid: Cid, did: &Did<'_>, did_key: &str) -> Result<Commit> {
    let bytes = blocks
        .get(&cid)
        .ok_or(VerificationError::CommitNotFound(cid))?;
    let commit = Commit::from_cbor(bytes)?;
    if commit.did() != did {
        return Err(VerificationError::DidMismatch {
            commit_did: commit.did().to_string(),
            expected_did: did.to_string(),
        }
        .into());
    }
    if !commit.verify_sig(did_key)? {
        return Err(VerificationError::BadSignature {
            did: did.to_string(),
        }
        .into());
    }
    Ok(commit)
}

async fn read_signed(
    car_bytes: impl Into<Bytes>,
    did: &Did<'_>,
    did_key: &str,
    options: CarReadOptions,
) -> Result<(Cid, Commit, BlockMap)> {
    let contents = read_car_bytes(car_bytes, options).await?;
    let root = contents
        .root()
        .ok_or_else(|| CarError::InvalidHeader("header has no roots".into()))?;
    let commit = verify_commit_block(&contents.blocks, root, did, did_key)?;
    Ok((root, commit, contents.blocks))
}

/// Check claims about individual records against a proof CAR.
///
/// Fails only if the CAR is malformed or its commit is not validly signed
/// by `did`. Every claim otherwise lands in exactly one of `verified` or
/// `unverified`. A claim is unverified when the proof contradicts it or
/// lacks the nodes needed to decide it.
#[tracing::instrument(skip(car_bytes, claims, did_key), fields(claims = claims.len()))]
pub async fn verify_proofs(
    car_bytes: impl Into<Bytes>,
    claims: Vec<RecordClaim>,
    did: &Did<'_>,
    did_key: &str,
) -> Result<VerifyProofsOutput> {
    let (_, commit, blocks) = read_signed(car_bytes, did, did_key, CarReadOptions::default()).await?;
    let storage = Arc::new(MemoryBlockStore::from_blocks(blocks));
    let tree = Mst::load(storage, commit.data(), None);

    let mut output = VerifyProofsOutput::default();
    for claim in claims {
        let found = match DataKey::new(&claim.collection, &claim.rkey) {
            Ok(key) => tree.get(&key.to_key()).await,
            Err(e) => Err(e),
        };
        let holds = match (&found, claim.cid) {
            (Ok(found), claimed) => *found == claimed,
            (Err(e), _) => {
                tracing::trace!(collection = %claim.collection, rkey = %claim.rkey, error = %e, "proof cannot decide claim");
                false
            }
        };
        if holds {
            output.verified.push(claim);
        } else {
            output.unverified.push(claim);
        }
    }
    tracing::debug!(
        verified = output.verified.len(),
        unverified = output.unverified.len(),
        "checked record proofs"
    );
    Ok(output)
}

/// Collect leaves from every node the store holds, skipping absent subtrees
fn reachable_leaves<'a>(
    node: &'a Mst<MemoryBlockStore>,
    store: &'a MemoryBlockStore,
    out: &'a mut Vec<(SmolStr, Cid)>,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        for entry in node.entries().await? {
            match entry {
                NodeEntry::Leaf { key, value } => out.push((key.clone(), *value)),
                NodeEntry::Tree(subtree) => {
                    if store.has(&subtree.get_pointer().await?).await? {
                        reachable_leaves(subtree, store, out).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Every record a proof CAR establishes.
///
/// Walks whatever part of the tree the CAR contains and returns a claim for
/// each leaf whose record block is also present.
#[tracing::instrument(skip_all)]
pub async fn verify_records(car_bytes: impl Into<Bytes>, did: &Did<'_>, did_key: &str) -> Result<Vec<RecordClaim>> {
    let (_, commit, blocks) = read_signed(car_bytes, did, did_key, CarReadOptions::default()).await?;
    let store = MemoryBlockStore::from_blocks(blocks);
    if !store.has(&commit.data()).await? {
        return Ok(Vec::new());
    }
    let tree = Mst::load(Arc::new(store.clone()), commit.data(), None);

    let mut leaves = Vec::new();
    reachable_leaves(&tree, &store, &mut leaves).await?;

    let mut claims = Vec::new();
    for (key, cid) in leaves {
        if !store.has(&cid).await? {
            continue;
        }
        let key = DataKey::parse(&key)?;
        claims.push(RecordClaim::new(key.collection(), key.rkey(), Some(cid)));
    }
    Ok(claims)
}

fn decode_records(
    creates: &[RecordWriteDescript],
    blocks: &BlockMap,
    ensure_leaves: bool,
) -> Result<RepoContents> {
    let missing: CidSet = creates
        .iter()
        .filter_map(|w| w.cid)
        .filter(|cid| !blocks.has(cid))
        .collect();
    if ensure_leaves && !missing.is_empty() {
        return Err(RepoError::missing_blocks("record", missing.into_iter().collect()));
    }

    let mut records = RepoContents::new();
    for write in creates {
        let Some(cid) = write.cid else { continue };
        let Some(bytes) = blocks.get(&cid) else { continue };
        let record: Ipld = serde_ipld_dagcbor::from_slice(bytes)
            .map_err(|e| RepoError::unexpected_object(cid, "record", Some(Box::new(e))))?;
        if !matches!(record, Ipld::Map(_)) {
            return Err(RepoError::unexpected_object(cid, "record", None));
        }
        records
            .entry(SmolStr::new(write.key.collection()))
            .or_default()
            .insert(SmolStr::new(write.key.rkey()), record);
    }
    Ok(records)
}

/// Check a complete repository CAR.
///
/// Verifies the commit signature, loads every tree node from the CAR
/// (failing with `MissingBlocks` if any is absent) and, unless disabled,
/// requires every record block.
#[tracing::instrument(skip(car_bytes, did_key, options), fields(did = %did))]
pub async fn verify_repo(
    car_bytes: impl Into<Bytes>,
    did: &Did<'_>,
    did_key: &str,
    options: VerifyOptions,
) -> Result<VerifiedRepo> {
    let (cid, commit, blocks) = read_signed(car_bytes, did, did_key, options.car).await?;
    let storage = Arc::new(MemoryBlockStore::from_blocks(blocks.clone()));
    let tree = Mst::load(storage, commit.data(), None);

    let diff = DataDiff::of(&tree, None).await?;
    let creates = diff.write_descripts()?;
    let records = decode_records(&creates, &blocks, options.ensure_leaves)?;
    tracing::debug!(records = creates.len(), "verified repository");

    Ok(VerifiedRepo {
        commit: CommitData {
            cid,
            rev: commit.rev().clone(),
            since: None,
            prev: commit.prev(),
            relevant_blocks: blocks.clone(),
            new_blocks: blocks,
            removed_cids: CidSet::new(),
        },
        creates,
        records,
    })
}

async fn diff_from<B: BlockStore + 'static>(
    storage: Arc<B>,
    prev_data: Option<Cid>,
    data: Cid,
) -> Result<DataDiff> {
    let curr = Mst::load(storage.clone(), data, None);
    let prev = prev_data.map(|cid| Mst::load(storage, cid, None));
    DataDiff::of(&curr, prev.as_ref()).await
}

/// Check an incremental update against a trusted repository.
///
/// `update_blocks` must hold the new commit (at `update_root`) plus every
/// tree node and record the transition introduces. Blocks the trusted
/// repository already holds may be omitted. With no trusted repository the
/// update must be self-contained.
///
/// Rejects an update that:
/// - is not signed by `did` with `did_key`
/// - changes the repository DID
/// - does not advance the revision
/// - names a `prev` other than the trusted head
/// - carries blocks the transition does not explain
#[tracing::instrument(skip_all, fields(did = %did, root = %update_root))]
pub async fn verify_diff<S: RepoStore + 'static>(
    repo: Option<&Repo<S>>,
    update_blocks: BlockMap,
    update_root: Cid,
    did: &Did<'_>,
    did_key: &str,
    options: VerifyOptions,
) -> Result<VerifiedDiff> {
    let commit = verify_commit_block(&update_blocks, update_root, did, did_key)?;
    if let Some(repo) = repo {
        if repo.did() != commit.did() {
            return Err(VerificationError::DidMismatch {
                commit_did: commit.did().to_string(),
                expected_did: repo.did().to_string(),
            }
            .into());
        }
        if commit.rev().as_str() <= repo.rev().as_str() {
            return Err(VerificationError::RevNotIncreasing {
                prev: repo.rev().to_string(),
                next: commit.rev().to_string(),
            }
            .into());
        }
        if let Some(prev) = commit.prev().filter(|prev| *prev != repo.cid()) {
            return Err(VerificationError::PrevMismatch {
                expected: repo.cid(),
                actual: prev,
            }
            .into());
        }
    }

    let staged = MemoryBlockStore::from_blocks(update_blocks.clone());
    let diff = match repo {
        Some(repo) => {
            let layered = SyncStorage::new(staged, repo.storage().clone());
            diff_from(Arc::new(layered), Some(repo.commit().data()), commit.data()).await?
        }
        None => diff_from(Arc::new(staged), None, commit.data()).await?,
    };

    let mut unexplained = Vec::new();
    for cid in update_blocks.cids() {
        if cid == update_root || diff.new_mst_blocks.has(&cid) || diff.new_leaf_cids.contains(&cid) {
            continue;
        }
        let held = match repo {
            Some(repo) => repo.storage().has(&cid).await?,
            None => false,
        };
        if !held {
            unexplained.push(cid);
        }
    }
    if let Some(first) = unexplained.first() {
        tracing::warn!(count = unexplained.len(), "update carries unrelated blocks");
        return Err(VerificationError::UnrelatedBlocks {
            count: unexplained.len(),
            first: *first,
        }
        .into());
    }

    let mut new_blocks = diff.new_mst_blocks.clone();
    let mut missing = Vec::new();
    for cid in &diff.new_leaf_cids {
        match update_blocks.get(cid) {
            Some(bytes) => {
                new_blocks.set(*cid, bytes.clone());
            }
            None => {
                let held = match repo {
                    Some(repo) => repo.storage().has(cid).await?,
                    None => false,
                };
                if !held {
                    missing.push(*cid);
                }
            }
        }
    }
    if options.ensure_leaves && !missing.is_empty() {
        return Err(RepoError::missing_blocks("record", missing));
    }
    if let Some(bytes) = update_blocks.get(&update_root) {
        new_blocks.set(update_root, bytes.clone());
    }

    let writes = diff.write_descripts()?;
    tracing::debug!(writes = writes.len(), "verified diff");

    Ok(VerifiedDiff {
        writes,
        commit: CommitData {
            cid: update_root,
            rev: commit.rev().clone(),
            since: repo.map(|r| r.rev().clone()),
            prev: commit.prev(),
            new_blocks,
            relevant_blocks: update_blocks,
            removed_cids: diff.removed_cids,
        },
    })
}
