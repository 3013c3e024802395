//! CAR (Content Addressable aRchive) streams
//!
//! A CAR v1 stream is a varint-length-prefixed DAG-CBOR header
//! `{roots, version: 1}` followed by sections of
//! `varint(len) || cid bytes || block bytes`. Order is significant to
//! streaming consumers and is preserved in both directions.
//!
//! Framing is done by `iroh-car`. Readers require at least one root, so a
//! root-less archive can be written but not read back.
//!
//! Reading a stream:
//! ```ignore
//! use loom_repo::car::{CarReadOptions, CarReader};
//!
//! let mut reader = CarReader::new(file, CarReadOptions::default()).await?;
//! while let Some(block) = reader.next_block().await? {
//!     println!("{} ({} bytes)", block.cid, block.bytes.len());
//! }
//! ```
//!
//! Writing one:
//! ```ignore
//! use loom_repo::car::write_car_bytes;
//!
//! let bytes = write_car_bytes(Some(commit_cid), blocks).await?;
//! ```

pub mod reader;
pub mod writer;

pub use reader::{CarContents, CarReader, ChunkReader, read_car_bytes, read_car_file, read_car_stream};
pub use writer::{
    blocks_to_car_stream, collect_car, write_car_bytes, write_car_file, write_car_stream,
};

/// Largest section accepted by default. `iroh-car` refuses anything larger,
/// so [`CarReadOptions::max_block_size`] can only lower it.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Options for decoding CAR streams
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
#[builder(start_fn = new)]
pub struct CarReadOptions {
    /// Check that every block hashes to its CID. Turn off only for trusted input.
    #[builder(default = true)]
    pub verify_cids: bool,

    /// Sections longer than this are rejected as malformed
    #[builder(default = DEFAULT_MAX_BLOCK_SIZE)]
    pub max_block_size: usize,
}

impl Default for CarReadOptions {
    fn default() -> Self {
        Self::new().build()
    }
}
