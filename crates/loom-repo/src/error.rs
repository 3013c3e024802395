//! Error types for repository operations
//!
//! Everything public returns [`RepoError`]. The granular enums below are what
//! individual modules raise; each converts into a `RepoError` with the right
//! [`RepoErrorKind`] and stays reachable through the error source chain.

use cid::Cid;
use jacquard_common::types::string::AtStrError;
use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Storage backend failed
    Storage,
    /// Invalid MST structure
    InvalidMst,
    /// Invalid commit structure
    InvalidCommit,
    /// Invalid key, DID or record path
    InvalidKey,
    /// Key is already present in the tree
    KeyExists,
    /// Key is not present in the tree
    KeyNotFound,
    /// One or more referenced blocks are absent
    MissingBlocks,
    /// A block decoded to something other than what was expected
    UnexpectedObject,
    /// Block bytes do not hash to their CID
    CidMismatch,
    /// Cryptographic operation failed
    Crypto,
    /// Signed repository state failed verification
    Verification,
    /// Write attempted against a snapshot that is no longer the current root
    StaleRepo,
    /// Serialization/deserialization failed
    Serialization,
    /// CAR stream is malformed
    Car,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// CIDs that were found to be missing, if this is a missing-data error.
    ///
    /// Callers that can fetch blocks from elsewhere use this to retry.
    pub fn missing_cids(&self) -> Option<&[Cid]> {
        let block_err = self.source.as_deref()?.downcast_ref::<BlockError>()?;
        match block_err {
            BlockError::MissingBlock { cid, .. } => Some(std::slice::from_ref(cid)),
            BlockError::MissingBlocks { cids, .. } => Some(cids.as_slice()),
            BlockError::UnexpectedObject { .. } => None,
        }
    }

    /// The verification failure behind this error, if there is one
    pub fn verification(&self) -> Option<&VerificationError> {
        self.source.as_deref()?.downcast_ref::<VerificationError>()
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow protocol structure")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys must match [a-zA-Z0-9._:~-/]+, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// The key being added already has an entry
    pub fn key_exists(key: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::KeyExists, None)
            .with_context(format!("key already exists: {}", key))
            .with_help("use an update write to replace an existing record")
    }

    /// The key being updated or deleted has no entry
    pub fn key_not_found(key: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::KeyNotFound, None)
            .with_context(format!("key not found: {}", key))
    }

    /// A single block is absent from storage
    pub fn missing_block(cid: Cid, context: impl Into<String>) -> Self {
        BlockError::MissingBlock {
            cid,
            context: context.into(),
        }
        .into()
    }

    /// Several blocks are absent from storage
    pub fn missing_blocks(context: impl Into<String>, cids: Vec<Cid>) -> Self {
        BlockError::MissingBlocks {
            context: context.into(),
            cids,
        }
        .into()
    }

    /// A block exists but does not decode as `expected`
    pub fn unexpected_object(cid: Cid, expected: &'static str, source: Option<BoxError>) -> Self {
        BlockError::UnexpectedObject {
            cid,
            expected,
            source,
        }
        .into()
    }

    /// Bytes did not hash to the CID they were stored under
    pub fn cid_mismatch(expected: Cid, actual: Cid) -> Self {
        CarError::CidMismatch { expected, actual }.into()
    }

    /// Create a crypto error
    pub fn crypto(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Crypto, Some(Box::new(source)))
    }

    /// The snapshot a write was built from is no longer the stored root
    pub fn stale(expected: Option<Cid>, actual: Option<Cid>) -> Self {
        let show = |c: Option<Cid>| c.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
        Self::new(RepoErrorKind::StaleRepo, None)
            .with_context(format!(
                "commit builds on {} but stored root is {}",
                show(expected),
                show(actual)
            ))
            .with_help("reload the repository and rebuild the write batch")
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a CAR error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<AtStrError> for RepoError {
    fn from(e: AtStrError) -> Self {
        let context = format!("identifier: {}", e.source);
        RepoError::new(RepoErrorKind::InvalidKey, Some(Box::new(e))).with_context(context)
    }
}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::io(e)
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
            MstError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
        }
    }
}

/// Block lookup and decoding errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BlockError {
    /// A referenced block is not in the store
    #[error("missing {context} block: {cid}")]
    #[diagnostic(code(block::missing))]
    MissingBlock {
        /// The absent CID
        cid: Cid,
        /// What the block was needed for
        context: String,
    },

    /// Several referenced blocks are not in the store
    #[error("missing {} {context} blocks", .cids.len())]
    #[diagnostic(code(block::missing_many))]
    MissingBlocks {
        /// What the blocks were needed for
        context: String,
        /// The absent CIDs
        cids: Vec<Cid>,
    },

    /// A block did not decode into the expected shape
    #[error("block {cid} is not a valid {expected}")]
    #[diagnostic(code(block::unexpected_object))]
    UnexpectedObject {
        /// The offending block
        cid: Cid,
        /// The type we tried to read
        expected: &'static str,
        /// Decoder failure, if any
        #[source]
        source: Option<BoxError>,
    },
}

impl From<BlockError> for RepoError {
    fn from(e: BlockError) -> Self {
        let kind = match &e {
            BlockError::MissingBlock { .. } | BlockError::MissingBlocks { .. } => {
                RepoErrorKind::MissingBlocks
            }
            BlockError::UnexpectedObject { .. } => RepoErrorKind::UnexpectedObject,
        };
        RepoError::new(kind, Some(Box::new(e)))
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(i64),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Unsupported key type
    #[error("Unsupported key type: 0x{0:x}")]
    UnsupportedKeyType(u64),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
            other => RepoError::new(RepoErrorKind::Crypto, Some(Box::new(other))),
        }
    }
}

/// CAR framing errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CarError {
    /// Header could not be decoded
    #[error("invalid CAR header: {0}")]
    #[diagnostic(code(car::header))]
    InvalidHeader(String),

    /// Section framing or block CID could not be decoded
    #[error("malformed CAR section: {0}")]
    #[diagnostic(code(car::section))]
    Malformed(String),

    /// Section length exceeds the configured limit
    #[error("CAR section of {len} bytes exceeds limit of {max}")]
    #[diagnostic(code(car::too_large))]
    SectionTooLarge {
        /// Declared length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Block bytes do not match their CID
    #[error("CID mismatch: expected {expected}, bytes hash to {actual}")]
    #[diagnostic(
        code(car::cid_mismatch),
        help("the archive is corrupt or was tampered with")
    )]
    CidMismatch {
        /// CID the block was framed under
        expected: Cid,
        /// CID computed from the block bytes
        actual: Cid,
    },
}

impl From<CarError> for RepoError {
    fn from(e: CarError) -> Self {
        let kind = match &e {
            CarError::CidMismatch { .. } => RepoErrorKind::CidMismatch,
            _ => RepoErrorKind::Car,
        };
        RepoError::new(kind, Some(Box::new(e)))
    }
}

/// Signed-state verification failures
///
/// Any of these invalidates every claim made against the offending commit.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VerificationError {
    /// Commit block not present in the supplied blocks
    #[error("commit block not found: {0}")]
    #[diagnostic(code(verify::commit_not_found))]
    CommitNotFound(Cid),

    /// Commit belongs to a different repository
    #[error("DID mismatch: commit has {commit_did}, expected {expected_did}")]
    #[diagnostic(
        code(verify::did_mismatch),
        help("the commit must be signed by the expected DID")
    )]
    DidMismatch {
        /// DID in the commit
        commit_did: String,
        /// Expected DID
        expected_did: String,
    },

    /// Commit signature does not verify against the signing key
    #[error("invalid signature on commit for {did}")]
    #[diagnostic(
        code(verify::bad_signature),
        help("the commit signature must be valid for the repository signing key")
    )]
    BadSignature {
        /// Repository DID
        did: String,
    },

    /// New commit does not advance the revision
    #[error("revision {next} does not advance past {prev}")]
    #[diagnostic(code(verify::rev_not_increasing))]
    RevNotIncreasing {
        /// Trusted revision
        prev: String,
        /// Revision in the update
        next: String,
    },

    /// Commit does not build on the trusted head
    #[error("commit builds on {actual}, expected {expected}")]
    #[diagnostic(
        code(verify::prev_mismatch),
        help("the update belongs to a different history; resync from a full export")
    )]
    PrevMismatch {
        /// CID of the trusted head commit
        expected: Cid,
        /// `prev` the update carries
        actual: Cid,
    },

    /// Update carries blocks unrelated to the transition
    #[error("update carries {count} blocks unrelated to the commit transition (first: {first})")]
    #[diagnostic(
        code(verify::unrelated_blocks),
        help("diff updates may only carry the commit, new tree nodes and new records")
    )]
    UnrelatedBlocks {
        /// Number of unexplained blocks
        count: usize,
        /// First unexplained CID
        first: Cid,
    },
}

impl From<VerificationError> for RepoError {
    fn from(e: VerificationError) -> Self {
        RepoError::new(RepoErrorKind::Verification, Some(Box::new(e)))
    }
}
