//! Key rules, layer assignment and node (de)serialization

use super::node::{NodeData, NodeEntry, TreeEntry};
use super::{BoxFuture, Mst};
use crate::error::{MstError, Result};
use crate::storage::BlockStore;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::sync::Arc;

/// Longest key accepted by the tree
pub const MAX_KEY_LEN: usize = 256;

/// Layer a key lives at: leading zero bits of SHA-256(key), two bits per layer.
///
/// Two bits per layer gives a fanout of 4. This constant is shared with every
/// other implementation; changing it changes every root CID.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Check MST key format: non-empty, at most 256 bytes, `[a-zA-Z0-9._:~-/]`
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }

    if !key
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b':' | b'~' | b'-' | b'/'))
    {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Number of leading bytes shared by `a` and `b`
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Index of the first leaf whose key is `>= key`, or `entries.len()`
pub fn find_gt_or_equal_leaf_index<S>(entries: &[NodeEntry<S>], key: &str) -> usize {
    entries
        .iter()
        .position(|e| matches!(e, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
        .unwrap_or(entries.len())
}

/// Flatten in-memory entries into the wire form, prefix-compressing keys.
///
/// Subtree pointers are computed (and cached) on the way, which is why this
/// is async.
pub fn serialize_node_data<'a, S: BlockStore + 'static>(
    entries: &'a [NodeEntry<S>],
) -> BoxFuture<'a, NodeData> {
    Box::pin(async move {
        let mut data = NodeData::empty();
        let mut rest = entries;

        if let Some((NodeEntry::Tree(tree), tail)) = rest.split_first() {
            data.left = Some(tree.get_pointer().await?);
            rest = tail;
        }

        let mut last_key: &[u8] = &[];
        while let Some((entry, tail)) = rest.split_first() {
            let NodeEntry::Leaf { key, value } = entry else {
                return Err(MstError::InvalidNode("adjacent subtrees in node".into()).into());
            };
            rest = tail;

            let tree = match rest.split_first() {
                Some((NodeEntry::Tree(t), tail)) => {
                    rest = tail;
                    Some(t.get_pointer().await?)
                }
                _ => None,
            };

            let key = key.as_bytes();
            let prefix_len = common_prefix_len(last_key, key);
            data.entries.push(TreeEntry {
                key_suffix: key[prefix_len..].to_vec(),
                prefix_len: u8::try_from(prefix_len).map_err(|_| {
                    MstError::InvalidNode(format!("prefix length {} exceeds u8", prefix_len))
                })?,
                tree,
                value: *value,
            });
            last_key = key;
        }

        Ok(data)
    })
}

/// Layer implied by a wire node, when it carries at least one key
pub fn layer_from_data(data: &NodeData) -> Result<Option<usize>> {
    match data.entries.first() {
        Some(first) if first.prefix_len == 0 => {
            let key = std::str::from_utf8(&first.key_suffix)
                .map_err(|e| MstError::InvalidNode(format!("non-UTF-8 key: {}", e)))?;
            Ok(Some(layer_for_key(key)))
        }
        Some(_) => Err(MstError::InvalidNode("first entry has a non-zero prefix".into()).into()),
        None => Ok(None),
    }
}

/// Expand a wire node into in-memory entries.
///
/// Subtrees come back as unloaded [`Mst`] handles one layer below `layer`.
/// Keys are checked for order, shape and layer so that a corrupt or hostile
/// node is rejected here rather than producing a tree with a wrong shape.
pub fn deserialize_node_data<S: BlockStore + 'static>(
    storage: &Arc<S>,
    data: &NodeData,
    layer: Option<usize>,
) -> Result<Vec<NodeEntry<S>>> {
    let child_layer = match layer {
        Some(0) if data.left.is_some() || data.entries.iter().any(|e| e.tree.is_some()) => {
            return Err(MstError::InvalidNode("layer 0 node has subtrees".into()).into());
        }
        Some(l) => Some(l.saturating_sub(1)),
        None => None,
    };
    let subtree = |cid| NodeEntry::Tree(Mst::load(storage.clone(), cid, child_layer));

    let mut entries = Vec::with_capacity(data.entries.len() * 2 + 1);
    if let Some(left) = data.left {
        entries.push(subtree(left));
    }

    let mut last_key: Vec<u8> = Vec::new();
    for entry in &data.entries {
        let prefix_len = entry.prefix_len as usize;
        if prefix_len > last_key.len() {
            return Err(MstError::InvalidNode(format!(
                "prefix length {} longer than previous key",
                prefix_len
            ))
            .into());
        }
        let mut key = last_key[..prefix_len].to_vec();
        key.extend_from_slice(&entry.key_suffix);

        let key_str = std::str::from_utf8(&key)
            .map_err(|e| MstError::InvalidNode(format!("non-UTF-8 key: {}", e)))?;
        validate_key(key_str)?;
        if !last_key.is_empty() && key <= last_key {
            return Err(MstError::InvalidNode(format!("keys out of order at {}", key_str)).into());
        }
        if let Some(layer) = layer {
            if layer_for_key(key_str) != layer {
                return Err(MstError::InvalidNode(format!(
                    "key {} does not belong at layer {}",
                    key_str, layer
                ))
                .into());
            }
        }

        entries.push(NodeEntry::Leaf {
            key: SmolStr::new(key_str),
            value: entry.value,
        });
        if let Some(tree) = entry.tree {
            entries.push(subtree(tree));
        }
        last_key = key;
    }

    Ok(entries)
}
