//! Exporting repositories and record proofs as CAR streams

use crate::block::{Block, BlockMap, CidSet};
use crate::car::write_car_stream;
use crate::commit::Commit;
use crate::error::{RepoError, Result};
use crate::mst::{Mst, NodeEntry};
use crate::storage::{BlockStore, BlockStoreExt};
use crate::types::DataKey;
use bytes::Bytes;
use cid::Cid;
use n0_future::stream::{self, Boxed};
use std::collections::VecDeque;
use std::sync::Arc;

/// Pre-order walk over a stored repository, yielding blocks lazily
struct FullRepoBlocks<S> {
    storage: Arc<S>,
    commit_cid: Cid,
    started: bool,
    stack: Vec<Mst<S>>,
    pending: VecDeque<Block>,
    seen_records: CidSet,
}

impl<S: BlockStore + 'static> FullRepoBlocks<S> {
    fn new(storage: Arc<S>, commit_cid: Cid) -> Self {
        Self {
            storage,
            commit_cid,
            started: false,
            stack: Vec::new(),
            pending: VecDeque::new(),
            seen_records: CidSet::new(),
        }
    }

    async fn next_block(&mut self) -> Result<Option<Block>> {
        if !self.started {
            self.started = true;
            let bytes = self
                .storage
                .get(&self.commit_cid)
                .await?
                .ok_or_else(|| RepoError::missing_block(self.commit_cid, "commit"))?;
            let commit = Commit::from_cbor(&bytes)?;
            self.stack
                .push(Mst::load(self.storage.clone(), commit.data(), None));
            return Ok(Some(Block::new(self.commit_cid, bytes)));
        }

        if let Some(block) = self.pending.pop_front() {
            return Ok(Some(block));
        }

        let Some(node) = self.stack.pop() else {
            return Ok(None);
        };
        let (cid, bytes) = node.to_block().await?;

        let mut records = Vec::new();
        let mut subtrees = Vec::new();
        for entry in node.entries().await? {
            match entry {
                NodeEntry::Tree(subtree) => subtrees.push(subtree.clone()),
                NodeEntry::Leaf { value, .. } => {
                    if self.seen_records.insert(*value) {
                        records.push(*value);
                    }
                }
            }
        }
        if !records.is_empty() {
            let blocks = self.storage.get_blocks(&records).await?;
            for cid in records {
                if let Some(bytes) = blocks.get(&cid) {
                    self.pending.push_back(Block::new(cid, bytes.clone()));
                }
            }
        }
        self.stack.extend(subtrees.into_iter().rev());

        Ok(Some(Block::new(cid, bytes)))
    }
}

/// Stream the whole repository at `commit_cid` as a CAR.
///
/// The commit block comes first. Tree nodes follow in pre-order, so every
/// node arrives before its descendants, and each node is followed by the
/// record blocks of its own leaves. Nothing is read until the stream is
/// polled. A missing block ends the stream with a `MissingBlocks` error.
pub fn get_full_repo<S: BlockStore + 'static>(storage: Arc<S>, commit_cid: Cid) -> Boxed<Result<Bytes>> {
    let walk = FullRepoBlocks::new(storage, commit_cid);
    let blocks = stream::try_unfold(walk, |mut walk| async move {
        Ok(walk.next_block().await?.map(|block| (block, walk)))
    });
    write_car_stream(Some(commit_cid), Box::pin(blocks))
}

/// Stream a proof CAR for `keys` at `commit_cid`.
///
/// Carries the commit block, the covering proof of every key and the record
/// blocks of the keys that are present. Verifiers use it to check presence
/// or absence of each key without the rest of the repository.
#[tracing::instrument(skip(storage, keys), fields(keys = keys.len()))]
pub async fn get_records<S: BlockStore + 'static>(
    storage: Arc<S>,
    commit_cid: Cid,
    keys: &[DataKey],
) -> Result<Boxed<Result<Bytes>>> {
    let commit_bytes = storage
        .get(&commit_cid)
        .await?
        .ok_or_else(|| RepoError::missing_block(commit_cid, "commit"))?;
    let commit = Commit::from_cbor(&commit_bytes)?;
    let tree = Mst::load(storage.clone(), commit.data(), None);

    let keys: Vec<_> = keys.iter().map(DataKey::to_key).collect();
    let nodes = tree.covering_proofs(&keys).await?;

    let mut record_cids = Vec::new();
    for key in &keys {
        if let Some(cid) = tree.get(key).await? {
            record_cids.push(cid);
        }
    }
    let records: BlockMap = storage.get_blocks(&record_cids).await?;
    tracing::debug!(nodes = nodes.len(), records = records.len(), "collected record proofs");

    let mut blocks = vec![Block::new(commit_cid, commit_bytes)];
    blocks.extend(nodes.into_blocks());
    blocks.extend(records.into_blocks());
    Ok(write_car_stream(
        Some(commit_cid),
        stream::iter(blocks.into_iter().map(Ok)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::{CarReadOptions, CarReader, collect_car, read_car_bytes};
    use crate::repo::{RecordWriteOp, Repo};
    use crate::storage::MemoryBlockStore;
    use crate::types::Did;
    use ipld_core::ipld::Ipld;
    use std::collections::BTreeMap;

    async fn sample_repo(n: usize) -> Repo<MemoryBlockStore> {
        let keypair = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let writes: Vec<RecordWriteOp> = (0..n)
            .map(|i| RecordWriteOp::Create {
                key: DataKey::new("com.example.posts", format!("{:04}", i)).unwrap(),
                record: Ipld::Map(BTreeMap::from([(
                    "n".to_string(),
                    Ipld::Integer(i as i128),
                )])),
            })
            .collect();
        Repo::create(
            Arc::new(MemoryBlockStore::new()),
            Did::new("did:example:provider").unwrap(),
            &keypair,
            &writes,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn full_repo_is_pre_order() {
        let repo = sample_repo(60).await;
        let car = collect_car(get_full_repo(repo.storage().clone(), repo.cid()))
            .await
            .unwrap();

        let mut reader = CarReader::new(std::io::Cursor::new(car), CarReadOptions::default())
            .await
            .unwrap();
        assert_eq!(reader.root(), repo.cid());

        let first = reader.next_block().await.unwrap().unwrap();
        assert_eq!(first.cid, repo.cid());

        // Every node must arrive after the node that points at it.
        let nodes = repo.data().all_nodes().await.unwrap();
        let mut seen = CidSet::new();
        let mut count = 1;
        while let Some(block) = reader.next_block().await.unwrap() {
            count += 1;
            if nodes.has(&block.cid) && block.cid != repo.data().get_pointer().await.unwrap() {
                let parent_seen = nodes.iter().any(|(parent, bytes)| {
                    seen.contains(parent)
                        && bytes
                            .windows(block.cid.to_bytes().len())
                            .any(|w| w == block.cid.to_bytes().as_slice())
                });
                assert!(parent_seen, "node {} came before its parent", block.cid);
            }
            seen.insert(block.cid);
        }
        assert_eq!(count, 1 + nodes.len() + 60);
    }

    #[tokio::test]
    async fn full_repo_reports_missing_blocks() {
        let repo = sample_repo(5).await;
        let record = repo
            .get_record_cid("com.example.posts", "0002")
            .await
            .unwrap()
            .unwrap();
        let mut blocks = repo.storage().blocks();
        blocks.delete(&record);
        let storage = Arc::new(MemoryBlockStore::from_blocks(blocks));

        let err = collect_car(get_full_repo(storage, repo.cid())).await.unwrap_err();
        assert_eq!(err.missing_cids(), Some(&[record][..]));
    }

    #[tokio::test]
    async fn record_proofs_are_small() {
        let repo = sample_repo(200).await;
        let keys = [
            DataKey::new("com.example.posts", "0007").unwrap(),
            DataKey::new("com.example.posts", "absent").unwrap(),
        ];
        let car = collect_car(get_records(repo.storage().clone(), repo.cid(), &keys).await.unwrap())
            .await
            .unwrap();
        let contents = read_car_bytes(car, CarReadOptions::default()).await.unwrap();

        assert_eq!(contents.root(), Some(repo.cid()));
        assert!(contents.blocks.has(&repo.cid()));
        let record = repo.get_record_cid("com.example.posts", "0007").await.unwrap().unwrap();
        assert!(contents.blocks.has(&record));
        assert!(contents.blocks.len() < repo.storage().len() / 4);
    }

    #[tokio::test]
    async fn stream_is_lazy() {
        let storage = Arc::new(MemoryBlockStore::new());
        let missing = crate::block::cid_for_bytes(b"no such commit").unwrap();
        // Building the stream does no I/O; the error shows up on first poll.
        let chunks = get_full_repo(storage, missing);
        let err = collect_car(chunks).await.unwrap_err();
        assert_eq!(err.kind(), &crate::RepoErrorKind::MissingBlocks);
    }
}
