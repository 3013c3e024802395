//! Pull-based in-order traversal of MST leaves

use super::node::NodeEntry;
use super::tree::Mst;
use super::util::find_gt_or_equal_leaf_index;
use crate::error::Result;
use crate::storage::BlockStore;
use cid::Cid;
use smol_str::SmolStr;

/// Cursor over the leaves of a tree, in key order.
///
/// Holds the path from the root to the current position as a stack of
/// `(node, next index)` frames. Nodes are loaded only when the walk reaches
/// them, so a walker that is dropped early never touches the rest of the
/// tree.
///
/// ```ignore
/// let mut walker = mst.walk_leaves_from("app.bsky.feed.post/").await?;
/// while let Some((key, cid)) = walker.next_leaf().await? {
///     if !key.starts_with("app.bsky.feed.post/") {
///         break;
///     }
///     println!("{} -> {}", key, cid);
/// }
/// ```
#[derive(Debug)]
pub struct MstWalker<S> {
    stack: Vec<(Mst<S>, usize)>,
}

impl<S: BlockStore + 'static> MstWalker<S> {
    /// Position a walker on the first leaf `>= from`, or the first leaf overall
    pub(crate) async fn seek(root: &Mst<S>, from: Option<&str>) -> Result<Self> {
        let mut stack = Vec::new();
        let mut node = root.clone();
        loop {
            let entries = node.entries().await?;
            let (idx, descend) = match from {
                Some(key) => {
                    let idx = find_gt_or_equal_leaf_index(entries, key);
                    let exact = entries.get(idx).and_then(NodeEntry::leaf_key) == Some(key);
                    // Keys between the previous leaf and `key` live in the subtree before idx.
                    let prev = if exact {
                        None
                    } else {
                        idx.checked_sub(1).and_then(|i| entries[i].as_tree()).cloned()
                    };
                    (idx, prev)
                }
                None => (0, None),
            };
            stack.push((node, idx));
            match descend {
                Some(subtree) => node = subtree,
                None => break,
            }
        }
        Ok(Self { stack })
    }

    /// Next `(key, value)` pair, or `None` once the tree is exhausted
    pub async fn next_leaf(&mut self) -> Result<Option<(SmolStr, Cid)>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let entries = frame.0.entries().await?;
            let Some(entry) = entries.get(frame.1).cloned() else {
                self.stack.pop();
                continue;
            };
            frame.1 += 1;
            match entry {
                NodeEntry::Leaf { key, value } => return Ok(Some((key, value))),
                NodeEntry::Tree(subtree) => self.stack.push((subtree, 0)),
            }
        }
    }

    /// Whether the walk has finished
    pub fn is_done(&self) -> bool {
        self.stack.is_empty()
    }
}
