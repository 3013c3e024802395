//! Signed, content-addressed repositories
//!
//! A repository is a Merkle Search Tree mapping `collection/rkey` keys to
//! DAG-CBOR records, rooted in a commit signed by the owning DID. This crate
//! provides the pieces needed to build, store, exchange and check them:
//!
//! - **MST**: Immutable tree operations with a deterministic shape for any key set
//! - **Commits**: Signed commit objects with `did:key` signature verification
//! - **Repo**: Atomic batches of record writes producing new signed snapshots
//! - **CAR I/O**: Streaming archive encoding and decoding with CID checks
//! - **Storage**: Pluggable block storage with in-memory and CAR-file backends
//! - **Sync**: Full exports, record proofs, and verification of repositories and diffs
//!
//! # Example
//!
//! ```rust,ignore
//! use loom_repo::{DataKey, Did, MemoryBlockStore, RecordWriteOp, Repo};
//! use std::sync::Arc;
//!
//! # async fn example(keypair: k256::ecdsa::SigningKey, record: ipld_core::ipld::Ipld) -> loom_repo::Result<()> {
//! let did = Did::new("did:example:alice")?;
//! let repo = Repo::create(Arc::new(MemoryBlockStore::new()), did, &keypair, &[]).await?;
//!
//! let key = DataKey::new("com.example.posts", "3jzfcijpj2z2a")?;
//! let repo = repo
//!     .apply_writes(&[RecordWriteOp::Create { key, record }], &keypair)
//!     .await?;
//! assert!(repo.get_record("com.example.posts", "3jzfcijpj2z2a").await?.is_some());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// Blocks, CIDs and block maps
pub mod block;
/// CAR (Content Addressable aRchive) utilities
pub mod car;
/// Commit structures and signature verification
pub mod commit;
/// Signing keys and `did:key` verification
pub mod crypto;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// High-level repository operations
pub mod repo;
/// Block storage abstraction
pub mod storage;
pub mod sync;
/// Identifier types: DIDs, TIDs and record keys
pub mod types;

pub use block::{Block, BlockMap, CidSet};
pub use car::{CarReadOptions, CarReader};
pub use commit::{Commit, UnsignedCommit};
pub use crypto::{Keypair, verify_signature};
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{DataDiff, Mst};
pub use repo::{CommitData, RecordWriteDescript, RecordWriteOp, Repo, RepoContents, WriteAction};
pub use storage::{BlockStore, CarFileStore, MemoryBlockStore, RepoStore, SyncStorage};
pub use sync::{RecordClaim, VerifyOptions};
pub use types::{DataKey, Did, Tid, TidExt};
