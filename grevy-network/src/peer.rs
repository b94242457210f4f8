//! Client-side connection handling.

pub mod client;
pub mod error;

pub use client::{BlockResponse, BlockSink, ChainClient, Client, HeaderFetch, PeerAddr};
pub use error::ClientError;
