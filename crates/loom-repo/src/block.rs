//! Content-addressed blocks and in-memory block collections

use crate::error::{RepoError, Result};
use bytes::Bytes;
use cid::Cid;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR: u64 = 0x71;

/// Raw codec identifier for CIDs (0x55)
pub const RAW: u64 = 0x55;

/// SHA2-256 multihash code
pub const SHA2_256: u64 = 0x12;

/// Set of CIDs, ordered for deterministic iteration
pub type CidSet = BTreeSet<Cid>;

/// Compute the CIDv1 for already-encoded DAG-CBOR bytes
pub fn cid_for_bytes(data: &[u8]) -> Result<Cid> {
    cid_with_codec(DAG_CBOR, data)
}

/// Compute the CIDv1 for `data` under `codec`, hashed with SHA2-256
pub fn cid_with_codec(codec: u64, data: &[u8]) -> Result<Cid> {
    let digest = Sha256::digest(data);
    Ok(Cid::new_v1(codec, multihash_of(SHA2_256, digest.as_slice())?))
}

fn multihash_of(code: u64, digest: &[u8]) -> Result<multihash::Multihash<64>> {
    multihash::Multihash::<64>::wrap(code, digest).map_err(RepoError::serialization)
}

/// Check that `data` hashes to `cid`, using the codec and hash the CID declares
///
/// Only SHA2-256 is supported; any other hash function is reported as a mismatch.
pub fn verify_cid(cid: &Cid, data: &[u8]) -> Result<()> {
    let actual = cid_with_codec(cid.codec(), data)?;
    if cid.hash().code() != SHA2_256 || actual != *cid {
        return Err(RepoError::cid_mismatch(*cid, actual));
    }
    Ok(())
}

/// Encode a value as canonical DAG-CBOR
pub fn encode_dag_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_ipld_dagcbor::to_vec(value)
        .map(Bytes::from)
        .map_err(RepoError::serialization)
}

/// Encode a value as DAG-CBOR and return its CID alongside the bytes
pub fn cid_for_cbor<T: Serialize + ?Sized>(value: &T) -> Result<(Cid, Bytes)> {
    let bytes = encode_dag_cbor(value)?;
    let cid = cid_for_bytes(&bytes)?;
    Ok((cid, bytes))
}

/// A block: bytes plus the CID they hash to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Content identifier
    pub cid: Cid,
    /// Encoded bytes
    pub bytes: Bytes,
}

impl Block {
    /// Pair bytes with a known CID without rehashing
    pub fn new(cid: Cid, bytes: impl Into<Bytes>) -> Self {
        Self {
            cid,
            bytes: bytes.into(),
        }
    }

    /// Encode `value` and address it
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let (cid, bytes) = cid_for_cbor(value)?;
        Ok(Self { cid, bytes })
    }
}

/// In-memory map of CID to block bytes
///
/// Blocks are shared `Bytes`, so copying a map or merging one into another
/// never copies payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    map: BTreeMap<Cid, Bytes>,
}

impl BlockMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `value` as DAG-CBOR, store it, and return its CID
    pub fn add<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Cid> {
        let (cid, bytes) = cid_for_cbor(value)?;
        self.map.insert(cid, bytes);
        Ok(cid)
    }

    /// Insert bytes under a CID
    pub fn set(&mut self, cid: Cid, bytes: Bytes) -> &mut Self {
        self.map.insert(cid, bytes);
        self
    }

    /// Look up a block
    pub fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.map.get(cid)
    }

    /// Remove a block, returning its bytes if present
    pub fn delete(&mut self, cid: &Cid) -> Option<Bytes> {
        self.map.remove(cid)
    }

    /// Whether the map holds `cid`
    pub fn has(&self, cid: &Cid) -> bool {
        self.map.contains_key(cid)
    }

    /// Split `cids` into found blocks and the CIDs that are not here
    pub fn get_many<'a>(&self, cids: impl IntoIterator<Item = &'a Cid>) -> (BlockMap, Vec<Cid>) {
        let mut blocks = BlockMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.map.get(cid) {
                Some(bytes) => {
                    blocks.map.insert(*cid, bytes.clone());
                }
                None => missing.push(*cid),
            }
        }
        (blocks, missing)
    }

    /// Merge another map into this one
    pub fn add_map(&mut self, other: BlockMap) -> &mut Self {
        self.map.extend(other.map);
        self
    }

    /// Merge a borrowed map into this one
    pub fn extend_from(&mut self, other: &BlockMap) -> &mut Self {
        self.map
            .extend(other.map.iter().map(|(c, b)| (*c, b.clone())));
        self
    }

    /// Iterate blocks in CID order
    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Bytes)> {
        self.map.iter()
    }

    /// Call `f` for every block
    pub fn for_each(&self, mut f: impl FnMut(&Cid, &Bytes)) {
        for (cid, bytes) in &self.map {
            f(cid, bytes);
        }
    }

    /// All CIDs held
    pub fn cids(&self) -> Vec<Cid> {
        self.map.keys().copied().collect()
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total payload size, not counting CIDs
    pub fn size_in_bytes(&self) -> usize {
        self.map.values().map(|b| b.len()).sum()
    }

    /// Consume into blocks in CID order
    pub fn into_blocks(self) -> impl Iterator<Item = Block> {
        self.map
            .into_iter()
            .map(|(cid, bytes)| Block { cid, bytes })
    }
}

impl From<BTreeMap<Cid, Bytes>> for BlockMap {
    fn from(map: BTreeMap<Cid, Bytes>) -> Self {
        Self { map }
    }
}

impl From<BlockMap> for BTreeMap<Cid, Bytes> {
    fn from(value: BlockMap) -> Self {
        value.map
    }
}

impl FromIterator<(Cid, Bytes)> for BlockMap {
    fn from_iter<I: IntoIterator<Item = (Cid, Bytes)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

impl Extend<(Cid, Bytes)> for BlockMap {
    fn extend<I: IntoIterator<Item = (Cid, Bytes)>>(&mut self, iter: I) {
        self.map.extend(iter);
    }
}

impl IntoIterator for BlockMap {
    type Item = (Cid, Bytes);
    type IntoIter = std::collections::btree_map::IntoIter<Cid, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

impl<'a> IntoIterator for &'a BlockMap {
    type Item = (&'a Cid, &'a Bytes);
    type IntoIter = std::collections::btree_map::Iter<'a, Cid, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}
