//! Client-side errors.

use thiserror::Error;

use grevy_chain::SerializationError;

use crate::protocol::segment::ChannelMode;

/// An error from a client operation.
///
/// Any error resets the client's connection; the next operation redials and
/// negotiates again. The one exception is [`ClientError::NoBlocks`], which is
/// a well-formed reply and leaves the connection usable.
#[derive(Error, Debug)]
pub enum ClientError {
    /// An underlying IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation step exceeded its deadline.
    #[error("the operation timed out")]
    Timeout,

    /// A message failed to encode or decode.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Name resolution produced no usable address.
    #[error("dns resolution for {0} returned no results")]
    NoAddress(String),

    /// The peer refused the proposed versions.
    #[error("the peer refused the proposed versions: {0}")]
    Refused(String),

    /// The peer accepted a version outside the requested range.
    #[error("the peer ignored the requested version range and returned {0}")]
    VersionOutOfRange(u64),

    /// A reply segment belonged to the wrong side or mini-protocol.
    #[error("unexpected reply: mode {mode:?}, protocol id {protocol}")]
    UnexpectedReply {
        /// The mode the segment carried.
        mode: ChannelMode,
        /// The raw protocol id the segment carried.
        protocol: u16,
    },

    /// A reply message had a tag the operation cannot process.
    #[error("unexpected {protocol} message tag {tag}")]
    UnexpectedMessage {
        /// The mini-protocol the reply belonged to.
        protocol: &'static str,
        /// The offending tag.
        tag: u64,
    },

    /// A request was too large for a single segment.
    #[error("request payload is larger than a single segment allows: {0} bytes")]
    Oversized(usize),

    /// The peer closed the connection.
    #[error("the peer closed the connection")]
    ConnectionClosed,

    /// The peer does not hold the full requested block range.
    #[error("the peer does not have all requested blocks")]
    NoBlocks,

    /// A header fetch produced nothing and the caller required headers.
    #[error("received an empty header list")]
    EmptyHeaders,
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_source: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout
    }
}
