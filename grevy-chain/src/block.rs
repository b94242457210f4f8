//! Blocks, headers and chain positions.
//!
//! The network layer treats block bodies as opaque bytes produced by an
//! external decoder; this module carries the decoded attributes alongside the
//! raw encoding, which is all the protocol engine needs.

use std::fmt;

use minicbor::{data::Tag, decode, encode, Decoder, Encoder};

use crate::serialization::{FromCbor, SerializationError, ToCbor};

/// The CBOR tag wrapping embedded encodings (RFC 8949 tag 24).
const TAG_ENCODED_CBOR: u64 = 24;

/// A 32-byte block hash.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Parses a hash from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, SerializationError> {
        let bytes =
            hex::decode(s).map_err(|_| SerializationError::Parse("invalid hex in block hash"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SerializationError::Parse("block hash must be 32 bytes"))?;
        Ok(BlockHash(arr))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(\"{self}\")")
    }
}

fn decode_hash(d: &mut Decoder<'_>) -> Result<BlockHash, decode::Error> {
    let bytes = d.bytes()?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| decode::Error::message("block hash must be 32 bytes"))?;
    Ok(BlockHash(arr))
}

/// A position on the chain, identified by slot and block hash.
///
/// Encoded as `[slot, hash]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Point2 {
    /// The slot of the block.
    pub slot: u64,
    /// The hash of the block.
    pub hash: BlockHash,
}

impl ToCbor for Point2 {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(2)?;
        e.u64(self.slot)?;
        e.bytes(&self.hash.0)?;
        Ok(())
    }
}

impl FromCbor for Point2 {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        let slot = d.u64()?;
        let hash = decode_hash(d)?;
        Ok(Point2 { slot, hash })
    }
}

/// A chain position annotated with its block height.
///
/// Encoded as `[[slot, hash], height]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Point3 {
    /// The slot of the block.
    pub slot: u64,
    /// The hash of the block.
    pub hash: BlockHash,
    /// The height of the block.
    pub height: u64,
}

impl Point3 {
    /// Drops the height annotation.
    pub fn point2(&self) -> Point2 {
        Point2 {
            slot: self.slot,
            hash: self.hash,
        }
    }
}

impl From<Point3> for Point2 {
    fn from(p: Point3) -> Self {
        p.point2()
    }
}

impl ToCbor for Point3 {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(2)?;
        self.point2().encode_cbor(e)?;
        e.u64(self.height)?;
        Ok(())
    }
}

impl FromCbor for Point3 {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        let p = Point2::decode_cbor(d)?;
        let height = d.u64()?;
        Ok(Point3 {
            slot: p.slot,
            hash: p.hash,
            height,
        })
    }
}

/// The result of an intersection query against a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntersectionInfo {
    /// The deepest shared point, if any point matched.
    pub isect: Option<Point2>,
    /// The peer's current tip.
    pub tip: Point3,
}

/// A decoded block header.
///
/// The header body is encoded as `[slot, hash, prev_hash, height]`; on the
/// wire it travels era-wrapped as `[era, tag24(body bytes)]` so that receivers
/// can route the body to an era-specific decoder without inspecting it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// The era of the block.
    pub era: u64,
    /// The slot of the block.
    pub slot: u64,
    /// The hash of the block.
    pub hash: BlockHash,
    /// The hash of the preceding block.
    pub prev_hash: BlockHash,
    /// The height of the block.
    pub height: u64,
}

impl Header {
    /// The chain position of this header.
    pub fn point2(&self) -> Point2 {
        Point2 {
            slot: self.slot,
            hash: self.hash,
        }
    }

    /// The chain position of this header, with height.
    pub fn point3(&self) -> Point3 {
        Point3 {
            slot: self.slot,
            hash: self.hash,
            height: self.height,
        }
    }

    /// Returns the era-independent header body encoding.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        self.encode_body(&mut e)
            .expect("encoding into a Vec never fails");
        buf
    }

    fn encode_body<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(4)?;
        e.u64(self.slot)?;
        e.bytes(&self.hash.0)?;
        e.bytes(&self.prev_hash.0)?;
        e.u64(self.height)?;
        Ok(())
    }

    /// Decodes a header body for the given era.
    pub fn decode_body(era: u64, bytes: &[u8]) -> Result<Self, decode::Error> {
        let mut d = Decoder::new(bytes);
        d.array()?;
        let slot = d.u64()?;
        let hash = decode_hash(&mut d)?;
        let prev_hash = decode_hash(&mut d)?;
        let height = d.u64()?;
        Ok(Header {
            era,
            slot,
            hash,
            prev_hash,
            height,
        })
    }
}

impl ToCbor for Header {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(2)?;
        e.u64(self.era)?;
        e.tag(Tag::new(TAG_ENCODED_CBOR))?;
        e.bytes(&self.body_bytes())?;
        Ok(())
    }
}

impl FromCbor for Header {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        let era = d.u64()?;
        let tag = d.tag()?;
        if tag != Tag::new(TAG_ENCODED_CBOR) {
            return Err(decode::Error::message("expected an encoded-cbor tag"));
        }
        let body = d.bytes()?;
        Header::decode_body(era, body)
    }
}

/// A parsed block: opaque raw bytes plus the decoded attributes the protocol
/// engine routes on.
///
/// Encoded as `[[era, tag24(header body)], body bytes]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedBlock {
    header: Header,
    body: Vec<u8>,
    bytes: Vec<u8>,
}

impl ParsedBlock {
    /// Assembles a block from its header and opaque body.
    pub fn new(header: Header, body: Vec<u8>) -> Self {
        let mut bytes = Vec::new();
        let mut e = Encoder::new(&mut bytes);
        encode_block(&header, &body, &mut e).expect("encoding into a Vec never fails");
        ParsedBlock {
            header,
            body,
            bytes,
        }
    }

    /// Decodes one block from `d`, capturing its raw span from `src`.
    ///
    /// `src` must be the exact buffer `d` was created over.
    pub fn decode_cbor_span(d: &mut Decoder<'_>, src: &[u8]) -> Result<Self, decode::Error> {
        let start = d.position();
        d.array()?;
        let header = Header::decode_cbor(d)?;
        let body = d.bytes()?.to_vec();
        let end = d.position();
        Ok(ParsedBlock {
            header,
            body,
            bytes: src[start..end].to_vec(),
        })
    }

    /// Decodes a single block.
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        let mut d = Decoder::new(bytes);
        Ok(Self::decode_cbor_span(&mut d, bytes)?)
    }

    /// Decodes a concatenated sequence of blocks, as found in a chunk.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, SerializationError> {
        let mut d = Decoder::new(bytes);
        let mut blocks = Vec::new();
        while d.position() < bytes.len() {
            blocks.push(Self::decode_cbor_span(&mut d, bytes)?);
        }
        Ok(blocks)
    }

    /// The decoded header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The slot of the block.
    pub fn slot(&self) -> u64 {
        self.header.slot
    }

    /// The hash of the block.
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    /// The hash of the preceding block.
    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    /// The height of the block.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// The era of the block.
    pub fn era(&self) -> u64 {
        self.header.era
    }

    /// The size of the raw encoding in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The raw encoding of the whole block.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The opaque body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The chain position of this block.
    pub fn point2(&self) -> Point2 {
        self.header.point2()
    }

    /// The chain position of this block, with height.
    pub fn point3(&self) -> Point3 {
        self.header.point3()
    }
}

fn encode_block<W: encode::Write>(
    header: &Header,
    body: &[u8],
    e: &mut Encoder<W>,
) -> Result<(), encode::Error<W::Error>> {
    e.array(2)?;
    header.encode_cbor(e)?;
    e.bytes(body)?;
    Ok(())
}
