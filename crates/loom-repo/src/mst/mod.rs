//! Merkle Search Tree implementation

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

pub mod diff;
pub mod node;
pub mod proof;
pub mod tree;
pub mod util;
pub mod walker;

pub use diff::{DataDiff, DiffUpdate};
pub use node::{NodeData, NodeEntry, TreeEntry};
pub use tree::Mst;
pub use walker::MstWalker;

/// Boxed future used by the recursive tree operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;
