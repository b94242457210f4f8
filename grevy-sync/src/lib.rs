//! Chain synchronization for Grevy. 🦓
//!
//! Two pieces sit on top of the networking engine:
//!
//! - [`peer_info`]: finding the deepest block shared with a peer, by
//!   bisecting the local archive with batched intersection probes.
//! - [`pipeline`]: ordering downloaded blocks into chunks and handing them
//!   to the chunk registry, with compression on the blocking pool and a
//!   cancellation watermark for validation failures.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod peer_info;
pub mod pipeline;
pub mod progress;

use thiserror::Error;

use grevy_chain::{ChunkError, SerializationError};
use grevy_network::ClientError;

pub use peer_info::{find_peer, PeerInfo, POINTS_PER_QUERY};
pub use pipeline::{ChunkWriter, Syncer, Watermark};
pub use progress::{Progress, ProgressSink, TracingProgress};

/// An error during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A network operation failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The local archive rejected downloaded data.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Downloaded data failed to decode.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The peer stopped confirming an intersection it previously reported.
    #[error("the peer lost a previously reported intersection")]
    IntersectionLost,

    /// The block stream ended with an error report.
    #[error("the block stream failed: {0}")]
    Stream(String),

    /// A broken invariant inside the syncer.
    #[error("internal error: {0}")]
    Internal(String),
}
