//! The block-fetch mini-protocol: streaming closed block ranges.

pub mod message;
pub mod server;


pub use message::{decode_compressed, Message, ENCODING_RAW, ENCODING_ZSTD};
pub use server::{BlockFetchConfig, BlockFetchHandler};
