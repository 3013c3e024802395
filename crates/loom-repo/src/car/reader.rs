//! CAR decoding over `iroh-car`, from readers or chunked byte streams

use super::{CarReadOptions, DEFAULT_MAX_BLOCK_SIZE};
use crate::block::{Block, BlockMap, verify_cid};
use crate::error::{CarError, RepoError, Result};
use bytes::Bytes;
use cid::Cid;
use n0_future::stream::{self, Boxed, Stream, StreamExt};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::StreamReader;

/// `AsyncRead` adapter over a stream of byte chunks
pub type ChunkReader = StreamReader<Boxed<std::io::Result<Bytes>>, Bytes>;

/// Holds the first error raised by a chunk source.
///
/// `iroh-car` flattens I/O failures into parse errors, so the original error
/// is parked here and returned in their place.
#[derive(Debug, Clone, Default)]
struct SourceFailure(Arc<Mutex<Option<RepoError>>>);

impl SourceFailure {
    fn record(&self, err: RepoError) -> std::io::Error {
        let msg = err.to_string();
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
        std::io::Error::other(msg)
    }

    fn take(&self) -> Option<RepoError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn header_error(e: iroh_car::Error) -> RepoError {
    CarError::InvalidHeader(e.to_string()).into()
}

fn section_error(e: iroh_car::Error) -> RepoError {
    match e {
        iroh_car::Error::LdReadTooLarge(len) => CarError::SectionTooLarge {
            len,
            max: DEFAULT_MAX_BLOCK_SIZE,
        }
        .into(),
        other => CarError::Malformed(other.to_string()).into(),
    }
}

/// Block-by-block CAR decoder.
///
/// The header is parsed when the reader is created. Blocks are decoded one
/// at a time as [`next_block`](Self::next_block) is called, and each is
/// checked against its CID unless the options turn that off.
pub struct CarReader<R> {
    inner: iroh_car::CarReader<R>,
    root: Cid,
    options: CarReadOptions,
    failure: SourceFailure,
}

impl<R: AsyncRead + Unpin> std::fmt::Debug for CarReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarReader")
            .field("roots", &self.inner.header().roots())
            .field("options", &self.options)
            .finish()
    }
}

impl<R> CarReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Read the header from `reader` and return a reader positioned at the first block
    pub async fn new(reader: R, options: CarReadOptions) -> Result<Self> {
        Self::with_failure(reader, options, SourceFailure::default()).await
    }

    async fn with_failure(reader: R, options: CarReadOptions, failure: SourceFailure) -> Result<Self> {
        let inner = match iroh_car::CarReader::new(reader).await {
            Ok(inner) => inner,
            Err(e) => return Err(failure.take().unwrap_or_else(|| header_error(e))),
        };
        let root = inner
            .header()
            .roots()
            .first()
            .copied()
            .ok_or_else(|| CarError::InvalidHeader("header has no roots".into()))?;
        tracing::trace!(roots = inner.header().roots().len(), "read CAR header");
        Ok(Self {
            inner,
            root,
            options,
            failure,
        })
    }

    /// Root CIDs from the header
    pub fn roots(&self) -> &[Cid] {
        self.inner.header().roots()
    }

    /// First root
    pub fn root(&self) -> Cid {
        self.root
    }

    /// Next block, or `None` at a clean end of stream
    pub async fn next_block(&mut self) -> Result<Option<Block>> {
        let (cid, data) = match self.inner.next_block().await {
            Ok(Some(section)) => section,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.failure.take().unwrap_or_else(|| section_error(e))),
        };
        let len = cid.encoded_len() + data.len();
        if len > self.options.max_block_size {
            return Err(CarError::SectionTooLarge {
                len,
                max: self.options.max_block_size,
            }
            .into());
        }
        if self.options.verify_cids {
            verify_cid(&cid, &data)?;
        }
        Ok(Some(Block::new(cid, Bytes::from(data))))
    }

    /// Read every remaining block into a map
    pub async fn collect_blocks(mut self) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        while let Some(block) = self.next_block().await? {
            blocks.set(block.cid, block.bytes);
        }
        Ok(blocks)
    }

    /// Turn the remaining blocks into a stream that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Block>> + Send
    where
        R: 'static,
    {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_block().await?.map(|block| (block, reader)))
        })
    }
}

/// Parse the header of a chunk stream and return a reader for its blocks.
///
/// Chunk boundaries may fall anywhere. An error from the source ends the
/// read and is returned as-is.
pub async fn read_car_stream<St>(chunks: St, options: CarReadOptions) -> Result<CarReader<ChunkReader>>
where
    St: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let failure = SourceFailure::default();
    let slot = failure.clone();
    let chunks: Boxed<std::io::Result<Bytes>> =
        Box::pin(chunks.map(move |chunk| chunk.map_err(|e| slot.record(e))));
    CarReader::with_failure(StreamReader::new(chunks), options, failure).await
}

/// Fully decoded CAR contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarContents {
    /// Root CIDs from the header, never empty
    pub roots: Vec<Cid>,
    /// Every block in the archive
    pub blocks: BlockMap,
}

impl CarContents {
    /// First root
    pub fn root(&self) -> Option<Cid> {
        self.roots.first().copied()
    }
}

async fn read_all<R>(reader: CarReader<R>) -> Result<CarContents>
where
    R: AsyncRead + Send + Unpin,
{
    let roots = reader.roots().to_vec();
    let blocks = reader.collect_blocks().await?;
    tracing::debug!(blocks = blocks.len(), "decoded CAR");
    Ok(CarContents { roots, blocks })
}

/// Decode an in-memory CAR
#[tracing::instrument(skip_all, fields(len = tracing::field::Empty))]
pub async fn read_car_bytes(data: impl Into<Bytes>, options: CarReadOptions) -> Result<CarContents> {
    let data: Bytes = data.into();
    tracing::Span::current().record("len", data.len());
    read_all(CarReader::new(std::io::Cursor::new(data), options).await?).await
}

/// Decode a CAR file
pub async fn read_car_file(path: impl AsRef<Path>, options: CarReadOptions) -> Result<CarContents> {
    let file = tokio::fs::File::open(path).await?;
    read_all(CarReader::new(BufReader::new(file), options).await?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoErrorKind;
    use crate::car::writer::write_car_bytes;

    fn sample() -> (Cid, BlockMap) {
        let mut blocks = BlockMap::new();
        let root = blocks.add("root block").unwrap();
        for i in 0..20u32 {
            blocks.add(&vec![i; (i as usize) * 10]).unwrap();
        }
        (root, blocks)
    }

    fn chunked(data: &[u8], size: usize) -> Boxed<Result<Bytes>> {
        let chunks: Vec<Result<Bytes>> = data
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn any_chunking_decodes_the_same() {
        let (root, blocks) = sample();
        let car = write_car_bytes(Some(root), blocks.clone()).await.unwrap();

        for size in [1, 2, 3, 7, 64, car.len()] {
            let reader = read_car_stream(chunked(&car, size), CarReadOptions::default())
                .await
                .unwrap();
            assert_eq!(reader.root(), root);
            assert_eq!(reader.collect_blocks().await.unwrap(), blocks);
        }
    }

    #[tokio::test]
    async fn rootless_archive_is_unreadable() {
        let (_, blocks) = sample();
        let car = write_car_bytes(None, blocks).await.unwrap();
        let err = read_car_bytes(car, CarReadOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Car);
        assert!(err.to_string().contains("header"), "{err}");
    }

    #[tokio::test]
    async fn tampered_block_detected_unless_skipped() {
        let mut blocks = BlockMap::new();
        let cid = blocks.add("the original payload").unwrap();
        let mut car = write_car_bytes(Some(cid), blocks).await.unwrap();
        let last = car.len() - 1;
        car[last] ^= 0x01;

        let err = read_car_bytes(car.clone(), CarReadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::CidMismatch);

        let trusting = CarReadOptions::new().verify_cids(false).build();
        let contents = read_car_bytes(car, trusting).await.unwrap();
        assert!(contents.blocks.has(&cid));
    }

    #[tokio::test]
    async fn truncated_stream_is_error() {
        let (root, blocks) = sample();
        let car = write_car_bytes(Some(root), blocks).await.unwrap();
        let cut = car[..car.len() - 5].to_vec();
        let err = read_car_bytes(cut, CarReadOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Car);

        let err = read_car_bytes(Vec::new(), CarReadOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Car);
    }

    #[tokio::test]
    async fn oversized_section_rejected() {
        let mut blocks = BlockMap::new();
        let cid = blocks.add(&vec![7u8; 4096]).unwrap();
        let car = write_car_bytes(Some(cid), blocks).await.unwrap();
        let small = CarReadOptions::new().max_block_size(1024).build();
        let err = read_car_bytes(car, small).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"), "{err}");
    }

    #[tokio::test]
    async fn source_errors_propagate() {
        let (root, blocks) = sample();
        let car = write_car_bytes(Some(root), blocks).await.unwrap();
        let half = Bytes::copy_from_slice(&car[..car.len() / 2]);
        let failing: Boxed<Result<Bytes>> = Box::pin(stream::iter(vec![
            Ok(half),
            Err(crate::RepoError::io(std::io::Error::other("connection reset"))),
        ]));

        let mut reader = read_car_stream(failing, CarReadOptions::default()).await.unwrap();
        let err = loop {
            match reader.next_block().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream ended cleanly"),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), &RepoErrorKind::Io);
    }

    #[tokio::test]
    async fn source_error_before_header() {
        let failing: Boxed<Result<Bytes>> = Box::pin(stream::iter(vec![Err(
            crate::RepoError::io(std::io::Error::other("refused")),
        )]));
        let err = read_car_stream(failing, CarReadOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Io);
    }

    #[tokio::test]
    async fn reads_from_async_read() {
        let (root, blocks) = sample();
        let car = write_car_bytes(Some(root), blocks.clone()).await.unwrap();
        let reader = CarReader::new(std::io::Cursor::new(car), CarReadOptions::default())
            .await
            .unwrap();
        assert_eq!(reader.root(), root);

        let mut stream = Box::pin(reader.into_stream());
        let mut count = 0;
        while let Some(block) = stream.next().await {
            assert!(blocks.has(&block.unwrap().cid));
            count += 1;
        }
        assert_eq!(count, blocks.len());
    }
}
