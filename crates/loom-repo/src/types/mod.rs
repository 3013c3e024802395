//! Identifier types used by repositories
//!
//! DIDs, NSIDs, record keys and TIDs come from `jacquard-common`; this module
//! adds the record path and revision helpers a repository needs on top.

mod data_key;
mod tid;

pub use data_key::{DataKey, validate_collection, validate_rkey};
pub use jacquard_common::IntoStatic;
pub use jacquard_common::types::recordkey::Rkey;
pub use jacquard_common::types::string::{Did, Nsid, Tid};
pub use tid::{TidClock, TidExt};
