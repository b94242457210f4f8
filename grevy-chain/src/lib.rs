//! Chain data structures for Grevy. 🦓
//!
//! This crate holds the data model shared by the networking and sync layers:
//! chain positions ([`Point2`], [`Point3`]), parsed blocks and headers, chunk
//! grouping, and the append-only [`ChunkRegistry`] contract together with its
//! file-backed implementation, [`ChunkArchive`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod block;
pub mod chunk;
pub mod parameters;
pub mod registry;
pub mod serialization;

pub use block::{BlockHash, Header, IntersectionInfo, ParsedBlock, Point2, Point3};
pub use chunk::{chunk_id, BlockInfo, Chunk, ChunkError};
pub use parameters::NetworkParameters;
pub use registry::{ChunkArchive, ChunkRegistry, ChunkSummary};
pub use serialization::{FromCbor, SerializationError, ToCbor};
