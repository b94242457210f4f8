//! Chunks: contiguous ordered runs of blocks sharing one epoch-chunk id.

use thiserror::Error;

use crate::block::{BlockHash, ParsedBlock, Point2};

/// Returns the chunk id of a slot.
pub fn chunk_id(slot: u64, epoch_length: u64) -> u64 {
    slot / epoch_length
}

/// Location and identity of one block inside the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The chain position of the block.
    pub point: Point2,
    /// The hash of the preceding block.
    pub prev_hash: BlockHash,
    /// The height of the block.
    pub height: u64,
    /// The era of the block.
    pub era: u64,
    /// Offset of the block's first byte from the start of the chain.
    pub offset: u64,
    /// Size of the raw block encoding in bytes.
    pub size: u64,
}

impl BlockInfo {
    /// Offset of the first byte past this block.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// An error constructing or querying chunks.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// A chunk was constructed without blocks.
    #[error("a chunk must contain at least one block")]
    Empty,

    /// Blocks from more than one chunk id were grouped together.
    #[error("blocks from different chunk ids in one chunk: {0} and {1}")]
    MixedChunkIds(u64, u64),

    /// Block slots did not increase within the chunk.
    #[error("block slots within a chunk must be strictly increasing: {0} then {1}")]
    NonMonotonicSlot(u64, u64),

    /// A block's previous-hash did not match its predecessor.
    #[error("broken hash linkage at slot {slot}: expected prev {expected}, found {found}")]
    BrokenLinkage {
        /// Slot of the offending block.
        slot: u64,
        /// The hash the chain required.
        expected: BlockHash,
        /// The hash the block carried.
        found: BlockHash,
    },

    /// An appended chunk did not continue the chain.
    #[error("chunk offset {got} does not continue the chain at {expected}")]
    OffsetGap {
        /// The archive's current end offset.
        expected: u64,
        /// The offset the caller supplied.
        got: u64,
    },

    /// A block position was outside the archive.
    #[error("block position {0} is out of range")]
    BadPosition(usize),

    /// An underlying IO error, usually from compression or the data directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk contents failed to decode.
    #[error(transparent)]
    Serialization(#[from] crate::serialization::SerializationError),
}

/// A contiguous ordered run of blocks belonging to a single epoch-chunk id,
/// stored as one artifact.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Offset of the chunk's first byte from the start of the chain.
    pub offset: u64,
    /// Total uncompressed size of the chunk's blocks.
    pub data_size: u64,
    /// Size of the stored compressed artifact.
    pub compressed_size: u64,
    /// Number of blocks in the chunk.
    pub num_blocks: usize,
    /// Slot of the first block.
    pub first_slot: u64,
    /// Slot of the last block.
    pub last_slot: u64,
    /// Hash of the block preceding the chunk (or the genesis hash).
    pub prev_block_hash: BlockHash,
    /// Hash of the chunk's last block.
    pub last_block_hash: BlockHash,
    /// The blocks, in chain order.
    pub blocks: Vec<BlockInfo>,
}

impl Chunk {
    /// Builds a chunk from parsed blocks, enforcing the archive invariants:
    /// a single chunk id, strictly increasing slots, and unbroken hash
    /// linkage starting from `prev_block_hash`.
    pub fn build(
        offset: u64,
        prev_block_hash: BlockHash,
        blocks: &[ParsedBlock],
        compressed_size: u64,
        epoch_length: u64,
    ) -> Result<Self, ChunkError> {
        let first = blocks.first().ok_or(ChunkError::Empty)?;
        let id = chunk_id(first.slot(), epoch_length);

        let mut infos = Vec::with_capacity(blocks.len());
        let mut expected_prev = prev_block_hash;
        let mut prev_slot = None;
        let mut rel = 0u64;
        for blk in blocks {
            let bid = chunk_id(blk.slot(), epoch_length);
            if bid != id {
                return Err(ChunkError::MixedChunkIds(id, bid));
            }
            if let Some(ps) = prev_slot {
                if blk.slot() <= ps {
                    return Err(ChunkError::NonMonotonicSlot(ps, blk.slot()));
                }
            }
            if blk.prev_hash() != expected_prev {
                return Err(ChunkError::BrokenLinkage {
                    slot: blk.slot(),
                    expected: expected_prev,
                    found: blk.prev_hash(),
                });
            }
            infos.push(BlockInfo {
                point: blk.point2(),
                prev_hash: blk.prev_hash(),
                height: blk.height(),
                era: blk.era(),
                offset: offset + rel,
                size: blk.size(),
            });
            rel += blk.size();
            expected_prev = blk.hash();
            prev_slot = Some(blk.slot());
        }

        Ok(Chunk {
            offset,
            data_size: rel,
            compressed_size,
            num_blocks: infos.len(),
            first_slot: first.slot(),
            last_slot: prev_slot.unwrap_or(first.slot()),
            prev_block_hash,
            last_block_hash: expected_prev,
            blocks: infos,
        })
    }

    /// The chunk id shared by every block in the chunk.
    pub fn id(&self, epoch_length: u64) -> u64 {
        chunk_id(self.first_slot, epoch_length)
    }

    /// Offset of the first byte past the chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data_size
    }
}
