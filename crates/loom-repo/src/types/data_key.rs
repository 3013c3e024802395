use super::{Nsid, Rkey};
use crate::error::{RepoError, Result};
use smol_str::{SmolStr, format_smolstr};
use std::fmt;

/// Check that `collection` is a namespaced identifier like `com.example.post`
pub fn validate_collection(collection: &str) -> Result<()> {
    Nsid::new(collection).map_err(|e| {
        RepoError::from(e).with_help("collections are NSIDs such as com.example.post")
    })?;
    Ok(())
}

/// Check that `rkey` is a usable record key
pub fn validate_rkey(rkey: &str) -> Result<()> {
    Rkey::new(rkey).map_err(|e| {
        RepoError::from(e)
            .with_help("record keys match [a-zA-Z0-9.-_:~]{1,512} and are not '.' or '..'")
    })?;
    Ok(())
}

/// Path of a record inside a repository: `<collection>/<rkey>`.
///
/// This string is the MST key the record's CID is stored under.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataKey {
    collection: SmolStr,
    rkey: SmolStr,
}

impl DataKey {
    /// Validate and build a record path
    pub fn new(collection: impl AsRef<str>, rkey: impl AsRef<str>) -> Result<Self> {
        let (collection, rkey) = (collection.as_ref(), rkey.as_ref());
        validate_collection(collection)?;
        validate_rkey(rkey)?;
        Ok(Self {
            collection: SmolStr::new(collection),
            rkey: SmolStr::new(rkey),
        })
    }

    /// Split an MST key back into its collection and record key
    pub fn parse(key: &str) -> Result<Self> {
        let (collection, rkey) = key
            .split_once('/')
            .ok_or_else(|| RepoError::invalid_key(key).with_help("expected <collection>/<rkey>"))?;
        Self::new(collection, rkey)
    }

    /// The collection NSID
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The record key
    pub fn rkey(&self) -> &str {
        &self.rkey
    }

    /// The MST key for this record
    pub fn to_key(&self) -> SmolStr {
        format_smolstr!("{}/{}", self.collection, self.rkey)
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey({})", self)
    }
}
