//! CBOR serialization support shared by the chain and network layers.
//!
//! Wire values are tagged CBOR arrays encoded and decoded imperatively with
//! [`minicbor`], so every type controls its exact byte layout.

use std::convert::Infallible;

use minicbor::{decode, encode, Decoder, Encoder};
use thiserror::Error;

/// A serialization error.
#[derive(Error, Debug)]
pub enum SerializationError {
    /// An underlying IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The data to be deserialized was not valid CBOR.
    #[error("cbor decode error: {0}")]
    Decode(#[from] decode::Error),

    /// A value could not be encoded.
    #[error("cbor encode error: {0}")]
    Encode(String),

    /// The data was structurally valid CBOR with an unexpected shape.
    #[error("parse error: {0}")]
    Parse(&'static str),
}

impl From<encode::Error<Infallible>> for SerializationError {
    fn from(e: encode::Error<Infallible>) -> Self {
        SerializationError::Encode(e.to_string())
    }
}

/// Types with a canonical CBOR encoding.
pub trait ToCbor {
    /// Writes the CBOR encoding of `self` into `e`.
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>>;

    /// Returns the CBOR encoding of `self` as a byte vector.
    fn to_cbor_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        self.encode_cbor(&mut e)
            .expect("encoding into a Vec never fails");
        buf
    }
}

/// Types decodable from their canonical CBOR encoding.
pub trait FromCbor: Sized {
    /// Reads one value from `d`.
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error>;

    /// Decodes one value from the front of `bytes`.
    fn from_cbor_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        let mut d = Decoder::new(bytes);
        Ok(Self::decode_cbor(&mut d)?)
    }
}
