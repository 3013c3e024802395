//! Signed commit objects
//!
//! A commit binds a repository DID to a tree root and a revision, and points
//! at the commit it replaces. The signature covers the DAG-CBOR encoding of
//! every field except `sig` itself.

use crate::block::{cid_for_cbor, encode_dag_cbor};
use crate::crypto::{Keypair, verify_signature};
use crate::error::{CommitError, Result};
use crate::types::{Did, IntoStatic, Tid};
use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Deserializer, Serialize};

/// Commit format version written by this crate
pub const COMMIT_VERSION: i64 = 3;

fn owned_did<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Did<'static>, D::Error> {
    Did::deserialize(deserializer).map(IntoStatic::into_static)
}

/// Commit fields before signing.
///
/// Field order is the DAG-CBOR canonical order, so the struct encodes to the
/// exact bytes that get signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedCommit {
    /// Repository DID
    #[serde(deserialize_with = "owned_did")]
    pub did: Did<'static>,
    /// Revision
    pub rev: Tid,
    /// Root of the record tree
    pub data: Cid,
    /// Commit this one replaces, `null` for the first
    pub prev: Option<Cid>,
    /// Format version
    pub version: i64,
}

impl UnsignedCommit {
    /// Current-version commit over `data`
    pub fn new(did: Did<'static>, data: Cid, rev: Tid, prev: Option<Cid>) -> Self {
        Self {
            did,
            rev,
            data,
            prev,
            version: COMMIT_VERSION,
        }
    }

    /// Bytes the signature is computed over
    pub fn bytes(&self) -> Result<Bytes> {
        encode_dag_cbor(self)
    }

    /// Sign with `keypair`
    pub fn sign<K: Keypair + ?Sized>(self, keypair: &K) -> Result<Commit> {
        let sig = keypair.sign(&self.bytes()?)?;
        Ok(Commit {
            did: self.did,
            rev: self.rev,
            sig: sig.to_vec(),
            data: self.data,
            prev: self.prev,
            version: self.version,
        })
    }
}

/// Signed repository commit, stored as a DAG-CBOR block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(deserialize_with = "owned_did")]
    did: Did<'static>,
    rev: Tid,
    #[serde(with = "serde_bytes")]
    sig: Vec<u8>,
    data: Cid,
    prev: Option<Cid>,
    version: i64,
}

impl Commit {
    /// Decode a commit block, rejecting versions this crate cannot verify
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let commit: Commit = serde_ipld_dagcbor::from_slice(bytes)
            .map_err(|e| CommitError::Serialization(Box::new(e)))?;
        commit.check_version()?;
        Ok(commit)
    }

    /// Versions 2 and 3 share a layout; anything else is refused
    pub fn check_version(&self) -> Result<()> {
        match self.version {
            2 | 3 => Ok(()),
            v => Err(CommitError::InvalidVersion(v).into()),
        }
    }

    /// Encode as DAG-CBOR
    pub fn to_cbor(&self) -> Result<Bytes> {
        encode_dag_cbor(self)
    }

    /// CID and bytes of the commit block
    pub fn to_block(&self) -> Result<(Cid, Bytes)> {
        cid_for_cbor(self)
    }

    /// The fields the signature covers
    pub fn unsigned(&self) -> UnsignedCommit {
        UnsignedCommit {
            did: self.did.clone(),
            rev: self.rev.clone(),
            data: self.data,
            prev: self.prev,
            version: self.version,
        }
    }

    /// Check the signature against a `did:key`
    pub fn verify_sig(&self, did_key: &str) -> Result<bool> {
        verify_signature(did_key, &self.unsigned().bytes()?, &self.sig)
    }

    /// Repository DID
    pub fn did(&self) -> &Did<'static> {
        &self.did
    }

    /// Revision
    pub fn rev(&self) -> &Tid {
        &self.rev
    }

    /// Root of the record tree
    pub fn data(&self) -> Cid {
        self.data
    }

    /// Previous commit
    pub fn prev(&self) -> Option<Cid> {
        self.prev
    }

    /// Format version
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Raw signature bytes
    pub fn sig(&self) -> &[u8] {
        &self.sig
    }
}

/// Sign an unsigned commit
pub fn sign_commit<K: Keypair + ?Sized>(unsigned: UnsignedCommit, keypair: &K) -> Result<Commit> {
    unsigned.sign(keypair)
}

/// Verify a commit signature against a `did:key`. Pure, no I/O.
pub fn verify_commit_sig(commit: &Commit, did_key: &str) -> Result<bool> {
    commit.verify_sig(did_key)
}
