//! CAR encoding over `iroh-car`, as a stream of byte chunks or straight to a file

use crate::block::{Block, BlockMap};
use crate::error::{CarError, RepoError, Result};
use bytes::{Bytes, BytesMut};
use cid::Cid;
use integer_encoding::VarInt;
use iroh_car::{CarHeader, CarWriter};
use n0_future::stream::{self, Boxed, Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, BufWriter};

fn car_error(e: iroh_car::Error) -> RepoError {
    CarError::Malformed(e.to_string()).into()
}

fn header(root: Option<Cid>) -> CarHeader {
    CarHeader::new_v1(root.into_iter().collect())
}

/// Header section on its own, for archives with no blocks.
///
/// `CarWriter` only writes the header ahead of the first block.
fn header_section(root: Option<Cid>) -> Result<Bytes> {
    let encoded = header(root).encode().map_err(car_error)?;
    let mut out = encoded.len().encode_var_vec();
    out.extend_from_slice(&encoded);
    Ok(Bytes::from(out))
}

/// Shared buffer the chunk stream drains after every block
#[derive(Debug, Clone, Default)]
struct ChunkBuffer(Arc<Mutex<BytesMut>>);

impl ChunkBuffer {
    fn take(&self) -> Bytes {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).split().freeze()
    }
}

impl AsyncWrite for ChunkBuffer {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct ChunkState<B> {
    writer: CarWriter<ChunkBuffer>,
    buffer: ChunkBuffer,
    blocks: B,
    root: Option<Cid>,
    wrote_any: bool,
}

/// Encode `blocks` as a CAR stream.
///
/// The first chunk carries the header and the first block, then one chunk
/// follows per block. Blocks are written in the order the source yields
/// them. An error from the source is passed through as a stream error and
/// ends the stream.
pub fn write_car_stream<B>(root: Option<Cid>, blocks: B) -> Boxed<Result<Bytes>>
where
    B: Stream<Item = Result<Block>> + Unpin + Send + 'static,
{
    let buffer = ChunkBuffer::default();
    let state = ChunkState {
        writer: CarWriter::new(header(root), buffer.clone()),
        buffer,
        blocks,
        root,
        wrote_any: false,
    };
    Box::pin(stream::try_unfold(Some(state), |state| async move {
        let Some(mut state) = state else {
            return Ok(None);
        };
        match state.blocks.next().await {
            Some(block) => {
                let block = block?;
                state
                    .writer
                    .write(block.cid, &block.bytes)
                    .await
                    .map_err(car_error)?;
                state.wrote_any = true;
                let chunk = state.buffer.take();
                Ok(Some((chunk, Some(state))))
            }
            None if !state.wrote_any => Ok(Some((header_section(state.root)?, None))),
            None => Ok(None),
        }
    }))
}

/// CAR stream over the blocks of a map, in CID order
pub fn blocks_to_car_stream(root: Option<Cid>, blocks: BlockMap) -> Boxed<Result<Bytes>> {
    write_car_stream(root, stream::iter(blocks.into_blocks().map(Ok)))
}

/// Drain a CAR stream into one buffer, stopping at the first error
pub async fn collect_car(mut chunks: Boxed<Result<Bytes>>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = chunks.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Encode a block map to CAR bytes
pub async fn write_car_bytes(root: Option<Cid>, blocks: BlockMap) -> Result<Vec<u8>> {
    if blocks.is_empty() {
        return Ok(header_section(root)?.to_vec());
    }
    let mut buffer = Vec::new();
    let mut writer = CarWriter::new(header(root), &mut buffer);
    for (cid, bytes) in blocks.iter() {
        writer.write(*cid, bytes).await.map_err(car_error)?;
    }
    writer.finish().await.map_err(car_error)?;
    Ok(buffer)
}

/// Write a block map to a CAR file, replacing any existing file
pub async fn write_car_file(path: impl AsRef<Path>, root: Option<Cid>, blocks: BlockMap) -> Result<()> {
    if blocks.is_empty() {
        tokio::fs::write(path, header_section(root)?).await?;
        return Ok(());
    }
    let file = tokio::fs::File::create(path).await?;
    let mut writer = CarWriter::new(header(root), BufWriter::new(file));
    for (cid, bytes) in blocks.iter() {
        writer.write(*cid, bytes).await.map_err(car_error)?;
    }
    writer.finish().await.map_err(car_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoErrorKind;
    use crate::car::{CarReadOptions, CarReader, read_car_bytes, read_car_file};

    #[tokio::test]
    async fn preserves_source_order() {
        let blocks: Vec<Block> = (0..5u8)
            .rev()
            .map(|i| Block::encode(&format!("block {i}")).unwrap())
            .collect();
        let expected: Vec<Cid> = blocks.iter().map(|b| b.cid).collect();

        let source = stream::iter(blocks.into_iter().map(Ok));
        let chunks: Vec<Bytes> = write_car_stream(Some(expected[0]), source)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), expected.len());

        let bytes: Vec<u8> = chunks.concat();
        let mut reader = CarReader::new(std::io::Cursor::new(bytes), CarReadOptions::default())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(block) = reader.next_block().await.unwrap() {
            seen.push(block.cid);
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn stream_matches_buffered_writer() {
        let mut blocks = BlockMap::new();
        let root = blocks.add("root").unwrap();
        for i in 0..10u32 {
            blocks.add(&i).unwrap();
        }
        let streamed = collect_car(blocks_to_car_stream(Some(root), blocks.clone()))
            .await
            .unwrap();
        assert_eq!(streamed, write_car_bytes(Some(root), blocks).await.unwrap());
    }

    #[tokio::test]
    async fn source_error_ends_stream() {
        let good = Block::encode("fine").unwrap();
        let source = stream::iter(vec![
            Ok(good),
            Err(RepoError::missing_block(crate::block::cid_for_bytes(b"gone").unwrap(), "record")),
            Ok(Block::encode("never written").unwrap()),
        ]);

        let items: Vec<Result<Bytes>> = write_car_stream(None, source).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().kind(), &RepoErrorKind::MissingBlocks);
    }

    #[tokio::test]
    async fn header_only_archive() {
        let root = crate::block::cid_for_bytes(b"elsewhere").unwrap();
        let chunks: Vec<Bytes> = write_car_stream(Some(root), stream::iter(Vec::<Result<Block>>::new()))
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);

        let contents = read_car_bytes(chunks.concat(), CarReadOptions::default()).await.unwrap();
        assert_eq!(contents.root(), Some(root));
        assert!(contents.blocks.is_empty());
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.car");
        let mut blocks = BlockMap::new();
        let root = blocks.add("root").unwrap();
        blocks.add("leaf").unwrap();

        write_car_file(&path, Some(root), blocks.clone()).await.unwrap();
        let contents = read_car_file(&path, CarReadOptions::default()).await.unwrap();
        assert_eq!(contents.root(), Some(root));
        assert_eq!(contents.blocks, blocks);

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read_car_bytes(bytes, CarReadOptions::default()).await.unwrap(), contents);
    }
}
