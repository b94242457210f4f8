//! Networking code for Grevy. 🦓
//!
//! This crate implements the node-to-node mini-protocol engine: a
//! length-framed, multiplexed, bidirectional protocol stack that negotiates
//! versions, discovers chain intersections, fetches headers and streams
//! (optionally compressed) blocks between peers.
//!
//! The pieces, bottom up:
//!
//! - [`protocol::segment`]: the 8-byte segment framing shared by every
//!   mini-protocol, plus a tokio codec for it.
//! - [`transport`]: the duplex byte-stream abstraction the multiplexer owns.
//! - [`multiplexer`]: a fair scheduler routing ingress segments to
//!   per-protocol handlers and serialising their egress onto one transport.
//! - [`protocol::handshake`], [`protocol::chain_sync`],
//!   [`protocol::block_fetch`]: the mini-protocol state machines.
//! - [`peer`]: the client driver, with typed operations for finding
//!   intersections, fetching headers and streaming blocks.
//! - [`server`]: the accept loop wiring the default handler set onto each
//!   inbound connection.

#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![deny(clippy::await_holding_lock)]

pub mod config;
pub mod constants;
pub mod multiplexer;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod transport;

pub use config::Config;
pub use multiplexer::{
    ConnectionState, DataGenerator, Multiplexer, MultiplexerConfig, MultiplexerError,
    ProtocolError, ProtocolHandler,
};
pub use peer::{BlockResponse, BlockSink, ChainClient, Client, ClientError, HeaderFetch, PeerAddr};
pub use protocol::segment::{ChannelMode, MiniProtocol, Segment, SegmentCodec, SegmentHeader};
pub use server::{Server, ServerError, ShutdownHandle};
pub use transport::{TcpTransport, Transport, TransportError};
