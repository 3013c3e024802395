//! Moving repositories between parties
//!
//! The [`provider`] side streams stored repositories and record proofs as
//! CAR archives. The [`consumer`] side checks what it receives against a
//! DID and its signing key before trusting any of it.

pub mod consumer;
pub mod provider;

pub use consumer::{
    RecordClaim, VerifiedDiff, VerifiedRepo, VerifyOptions, VerifyProofsOutput, verify_commit_block, verify_diff,
    verify_proofs, verify_records, verify_repo,
};
pub use provider::{get_full_repo, get_records};
