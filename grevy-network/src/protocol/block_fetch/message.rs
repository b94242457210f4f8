//! Block-fetch message encodings.

use minicbor::{data::Tag, decode, encode, Decoder, Encoder};

use grevy_chain::{registry::decompress_chunk, FromCbor, Point2, SerializationError, ToCbor};

/// The CBOR tag wrapping embedded block encodings (RFC 8949 tag 24).
const TAG_ENCODED_CBOR: u64 = 24;

/// Compressed-batch payloads are the raw block bytes, unencoded.
pub const ENCODING_RAW: u64 = 0;

/// Compressed-batch payloads are zstd frames over the raw block bytes.
pub const ENCODING_ZSTD: u64 = 1;

/// Expands a compressed-batch payload according to its encoding id.
pub fn decode_compressed(encoding: u64, payload: &[u8]) -> Result<Vec<u8>, SerializationError> {
    match encoding {
        ENCODING_RAW => Ok(payload.to_vec()),
        ENCODING_ZSTD => Ok(decompress_chunk(payload)?),
        _ => Err(SerializationError::Parse(
            "unsupported compressed block encoding",
        )),
    }
}

/// A block-fetch message; the leading array element is the tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Tag 0: ask for the closed range `[from, to]`.
    RequestRange(Point2, Point2),
    /// Tag 1: the client is finished with this mini-protocol.
    ClientDone,
    /// Tag 2: the requested range exists and blocks follow.
    StartBatch,
    /// Tag 3: at least one end of the range is not held locally.
    NoBlocks,
    /// Tag 4: one raw block.
    Block(Vec<u8>),
    /// Tag 5: the batch is complete.
    BatchDone,
    /// Tag 6: several consecutive blocks in one compressed payload.
    CompressedBlocks(u64, Vec<u8>),
}

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u64 {
        match self {
            Message::RequestRange(..) => 0,
            Message::ClientDone => 1,
            Message::StartBatch => 2,
            Message::NoBlocks => 3,
            Message::Block(_) => 4,
            Message::BatchDone => 5,
            Message::CompressedBlocks(..) => 6,
        }
    }
}

impl ToCbor for Message {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Message::RequestRange(from, to) => {
                e.array(3)?;
                e.u64(0)?;
                from.encode_cbor(e)?;
                to.encode_cbor(e)?;
            }
            Message::ClientDone => {
                e.array(1)?;
                e.u64(1)?;
            }
            Message::StartBatch => {
                e.array(1)?;
                e.u64(2)?;
            }
            Message::NoBlocks => {
                e.array(1)?;
                e.u64(3)?;
            }
            Message::Block(bytes) => {
                e.array(2)?;
                e.u64(4)?;
                e.tag(Tag::new(TAG_ENCODED_CBOR))?;
                e.bytes(bytes)?;
            }
            Message::BatchDone => {
                e.array(1)?;
                e.u64(5)?;
            }
            Message::CompressedBlocks(encoding, payload) => {
                e.array(3)?;
                e.u64(6)?;
                e.u64(*encoding)?;
                e.bytes(payload)?;
            }
        }
        Ok(())
    }
}

impl FromCbor for Message {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        match d.u64()? {
            0 => Ok(Message::RequestRange(
                Point2::decode_cbor(d)?,
                Point2::decode_cbor(d)?,
            )),
            1 => Ok(Message::ClientDone),
            2 => Ok(Message::StartBatch),
            3 => Ok(Message::NoBlocks),
            4 => {
                let tag = d.tag()?;
                if tag != Tag::new(TAG_ENCODED_CBOR) {
                    return Err(decode::Error::message("expected an encoded-cbor tag"));
                }
                Ok(Message::Block(d.bytes()?.to_vec()))
            }
            5 => Ok(Message::BatchDone),
            6 => Ok(Message::CompressedBlocks(d.u64()?, d.bytes()?.to_vec())),
            _ => Err(decode::Error::message(
                "unsupported block-fetch message tag",
            )),
        }
    }
}
