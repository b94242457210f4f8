//! The chunk registry: an append-only archive of chain chunks.
//!
//! [`ChunkRegistry`] is the contract the protocol engine consumes; positions
//! are plain indexes into the block sequence, `None` standing in for
//! end-of-chain. [`ChunkArchive`] is the reference implementation: an
//! in-memory index over zstd-compressed chunk artifacts, optionally persisted
//! to a data directory.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use tracing::{debug, info};

use crate::{
    block::{BlockHash, Header, ParsedBlock, Point2, Point3},
    chunk::{BlockInfo, Chunk, ChunkError},
    parameters::NetworkParameters,
};

/// The zstd level used for stored chunk artifacts and block batches.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Compresses chunk data with the archive's on-disk settings.
pub fn compress_chunk(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::encode_all(data, COMPRESSION_LEVEL)
}

/// Decompresses a stored chunk artifact or a compressed block batch.
pub fn decompress_chunk(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(data)
}

/// A summary of one stored chunk, used by the intersection search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Slot of the chunk's first block.
    pub first_slot: u64,
    /// Hash of the chunk's first block.
    pub first_block_hash: BlockHash,
    /// Position of the chunk's first block in the archive.
    pub first_block_pos: usize,
    /// Number of blocks in the chunk.
    pub num_blocks: usize,
}

/// The archive operations consumed by the protocol engine.
///
/// Implementations must be shareable across the server's connection tasks, so
/// every method takes `&self`.
pub trait ChunkRegistry: Send + Sync {
    /// The best block currently known, or `None` for an empty chain.
    fn tip(&self) -> Option<Point3>;

    /// Total number of blocks in the archive.
    fn num_blocks(&self) -> usize;

    /// Total number of stored chunks.
    fn num_chunks(&self) -> usize;

    /// Summary of the chunk at `index`, in chain order.
    fn chunk_summary(&self, index: usize) -> Option<ChunkSummary>;

    /// Identity and location of the block at `pos`.
    fn block_info(&self, pos: usize) -> Option<BlockInfo>;

    /// Raw encoding of the block at `pos`.
    fn block_data(&self, pos: usize) -> Option<Vec<u8>>;

    /// Decoded header of the block at `pos`.
    fn header(&self, pos: usize) -> Option<Header>;

    /// Position of the block matching `point` by slot and hash.
    fn find_block(&self, point: &Point2) -> Option<usize>;

    /// Identity of the block at `slot` whose hash matches, if any.
    fn find_block_by_slot(&self, slot: u64, hash: &BlockHash) -> Option<BlockInfo>;

    /// Compressed data covering the blocks from `pos` up to `end` or the
    /// containing chunk's boundary, whichever comes first, together with the
    /// next position past the covered range.
    ///
    /// When the range covers a whole chunk remainder the stored artifact is
    /// returned unchanged, without recompression.
    fn chunk_remaining_data(&self, pos: usize, end: usize) -> Result<(Vec<u8>, usize), ChunkError>;

    /// Appends one compressed chunk at `offset`. Re-appending data the
    /// archive already holds is a no-op; anything else that does not continue
    /// the chain is an error.
    fn add_compressed(
        &self,
        offset: u64,
        compressed: &[u8],
        uncompressed: &[u8],
    ) -> Result<(), ChunkError>;
}

struct StoredChunk {
    meta: Chunk,
    headers: Vec<Header>,
    raw: Vec<u8>,
    compressed: Vec<u8>,
    first_pos: usize,
}

#[derive(Default)]
struct Index {
    chunks: Vec<StoredChunk>,
    total_blocks: usize,
}

impl Index {
    fn end_offset(&self) -> u64 {
        self.chunks.last().map(|c| c.meta.end_offset()).unwrap_or(0)
    }

    fn chunk_for_pos(&self, pos: usize) -> Option<&StoredChunk> {
        if pos >= self.total_blocks {
            return None;
        }
        let idx = self
            .chunks
            .partition_point(|c| c.first_pos + c.meta.num_blocks <= pos);
        self.chunks.get(idx)
    }

    fn position_by_slot(&self, slot: u64) -> Option<(&StoredChunk, usize)> {
        let idx = self.chunks.partition_point(|c| c.meta.last_slot < slot);
        let chunk = self.chunks.get(idx)?;
        let i = chunk
            .meta
            .blocks
            .binary_search_by_key(&slot, |b| b.point.slot)
            .ok()?;
        Some((chunk, chunk.first_pos + i))
    }
}

/// An in-memory chunk archive with optional directory persistence.
pub struct ChunkArchive {
    params: NetworkParameters,
    dir: Option<PathBuf>,
    inner: RwLock<Index>,
}

impl ChunkArchive {
    /// Creates an empty archive with no backing directory.
    pub fn ephemeral(params: NetworkParameters) -> Self {
        ChunkArchive {
            params,
            dir: None,
            inner: RwLock::new(Index::default()),
        }
    }

    /// Opens (or creates) an archive persisted under `dir`.
    ///
    /// Chunk artifacts are stored as `<offset>.zstd` files and reloaded in
    /// offset order.
    pub fn open(dir: impl AsRef<Path>, params: NetworkParameters) -> Result<Self, ChunkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|ext| ext == "zstd").unwrap_or(false))
            .collect();
        paths.sort();

        let mut index = Index::default();
        for path in &paths {
            let compressed = fs::read(path)?;
            let raw = decompress_chunk(&compressed)?;
            Self::append_chunk(&mut index, &params, compressed, raw)?;
        }
        info!(
            chunks = index.chunks.len(),
            blocks = index.total_blocks,
            ?dir,
            "opened chunk archive"
        );

        Ok(ChunkArchive {
            params,
            dir: Some(dir),
            inner: RwLock::new(index),
        })
    }

    /// The parameters this archive was opened with.
    pub fn params(&self) -> &NetworkParameters {
        &self.params
    }

    fn append_chunk(
        index: &mut Index,
        params: &NetworkParameters,
        compressed: Vec<u8>,
        raw: Vec<u8>,
    ) -> Result<(), ChunkError> {
        let blocks = ParsedBlock::decode_all(&raw)?;
        let prev = index
            .chunks
            .last()
            .map(|c| c.meta.last_block_hash)
            .unwrap_or(params.genesis_hash);
        let offset = index.end_offset();
        let meta = Chunk::build(
            offset,
            prev,
            &blocks,
            compressed.len() as u64,
            params.epoch_length,
        )?;
        let headers = blocks.iter().map(|b| b.header().clone()).collect();
        let num_blocks = blocks.len();
        index.chunks.push(StoredChunk {
            meta,
            headers,
            raw,
            compressed,
            first_pos: index.total_blocks,
        });
        index.total_blocks += num_blocks;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.inner.read().expect("archive lock poisoned")
    }
}

impl ChunkRegistry for ChunkArchive {
    fn tip(&self) -> Option<Point3> {
        let index = self.read();
        let last = index.chunks.last()?.meta.blocks.last()?;
        Some(Point3 {
            slot: last.point.slot,
            hash: last.point.hash,
            height: last.height,
        })
    }

    fn num_blocks(&self) -> usize {
        self.read().total_blocks
    }

    fn num_chunks(&self) -> usize {
        self.read().chunks.len()
    }

    fn chunk_summary(&self, index: usize) -> Option<ChunkSummary> {
        let guard = self.read();
        let chunk = guard.chunks.get(index)?;
        let first = chunk.meta.blocks.first()?;
        Some(ChunkSummary {
            first_slot: first.point.slot,
            first_block_hash: first.point.hash,
            first_block_pos: chunk.first_pos,
            num_blocks: chunk.meta.num_blocks,
        })
    }

    fn block_info(&self, pos: usize) -> Option<BlockInfo> {
        let guard = self.read();
        let chunk = guard.chunk_for_pos(pos)?;
        chunk.meta.blocks.get(pos - chunk.first_pos).cloned()
    }

    fn block_data(&self, pos: usize) -> Option<Vec<u8>> {
        let guard = self.read();
        let chunk = guard.chunk_for_pos(pos)?;
        let info = chunk.meta.blocks.get(pos - chunk.first_pos)?;
        let lo = (info.offset - chunk.meta.offset) as usize;
        let hi = lo + info.size as usize;
        Some(chunk.raw[lo..hi].to_vec())
    }

    fn header(&self, pos: usize) -> Option<Header> {
        let guard = self.read();
        let chunk = guard.chunk_for_pos(pos)?;
        chunk.headers.get(pos - chunk.first_pos).cloned()
    }

    fn find_block(&self, point: &Point2) -> Option<usize> {
        let guard = self.read();
        let (chunk, pos) = guard.position_by_slot(point.slot)?;
        let info = &chunk.meta.blocks[pos - chunk.first_pos];
        (info.point.hash == point.hash).then_some(pos)
    }

    fn find_block_by_slot(&self, slot: u64, hash: &BlockHash) -> Option<BlockInfo> {
        let guard = self.read();
        let (chunk, pos) = guard.position_by_slot(slot)?;
        let info = &chunk.meta.blocks[pos - chunk.first_pos];
        (info.point.hash == *hash).then(|| info.clone())
    }

    fn chunk_remaining_data(&self, pos: usize, end: usize) -> Result<(Vec<u8>, usize), ChunkError> {
        let guard = self.read();
        let chunk = guard.chunk_for_pos(pos).ok_or(ChunkError::BadPosition(pos))?;
        let chunk_end = chunk.first_pos + chunk.meta.num_blocks;
        let upper = end.min(chunk_end);
        if upper <= pos {
            return Err(ChunkError::BadPosition(pos));
        }
        if pos == chunk.first_pos && upper == chunk_end {
            return Ok((chunk.compressed.clone(), upper));
        }
        let first = &chunk.meta.blocks[pos - chunk.first_pos];
        let last = &chunk.meta.blocks[upper - 1 - chunk.first_pos];
        let lo = (first.offset - chunk.meta.offset) as usize;
        let hi = (last.end_offset() - chunk.meta.offset) as usize;
        let bytes = compress_chunk(&chunk.raw[lo..hi])?;
        Ok((bytes, upper))
    }

    fn add_compressed(
        &self,
        offset: u64,
        compressed: &[u8],
        uncompressed: &[u8],
    ) -> Result<(), ChunkError> {
        let mut index = self.inner.write().expect("archive lock poisoned");
        let end = index.end_offset();
        if offset < end {
            if offset + uncompressed.len() as u64 <= end {
                debug!(offset, "ignoring a chunk the archive already holds");
                return Ok(());
            }
            return Err(ChunkError::OffsetGap {
                expected: end,
                got: offset,
            });
        }
        if offset > end {
            return Err(ChunkError::OffsetGap {
                expected: end,
                got: offset,
            });
        }

        Self::append_chunk(
            &mut index,
            &self.params,
            compressed.to_vec(),
            uncompressed.to_vec(),
        )?;

        if let Some(dir) = &self.dir {
            fs::write(dir.join(format!("{offset:012}.zstd")), compressed)?;
        }
        Ok(())
    }
}
