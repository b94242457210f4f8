//! The 8-byte segment framing shared by every mini-protocol.
//!
//! A segment carries `{time_us: u32, meta: u32}` big-endian, where
//! `meta = (mode:1 | protocol id:15 | payload size:16)`, followed by exactly
//! `size` payload bytes. Logical messages larger than one segment are
//! fragmented across consecutive segments of the same mini-protocol.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use grevy_chain::SerializationError;

/// One of the independent sub-protocols sharing a single connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MiniProtocol {
    /// Version negotiation; always the first traffic on a connection.
    Handshake,
    /// Header streaming and intersection discovery.
    ChainSync,
    /// Block range streaming.
    BlockFetch,
    /// Transaction submission. Recognised on the wire but not served.
    TxSubmission,
    /// Connection keep-alive. Recognised on the wire but not served.
    KeepAlive,
}

impl MiniProtocol {
    /// The wire identifier of this mini-protocol.
    pub fn id(self) -> u16 {
        match self {
            MiniProtocol::Handshake => 0,
            MiniProtocol::ChainSync => 2,
            MiniProtocol::BlockFetch => 3,
            MiniProtocol::TxSubmission => 4,
            MiniProtocol::KeepAlive => 8,
        }
    }

    /// Maps a wire identifier back to a known mini-protocol.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(MiniProtocol::Handshake),
            2 => Some(MiniProtocol::ChainSync),
            3 => Some(MiniProtocol::BlockFetch),
            4 => Some(MiniProtocol::TxSubmission),
            8 => Some(MiniProtocol::KeepAlive),
            _ => None,
        }
    }
}

impl fmt::Display for MiniProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MiniProtocol::Handshake => "handshake",
            MiniProtocol::ChainSync => "chain_sync",
            MiniProtocol::BlockFetch => "block_fetch",
            MiniProtocol::TxSubmission => "tx_submission",
            MiniProtocol::KeepAlive => "keep_alive",
        };
        f.write_str(name)
    }
}

/// Which side of the connection sent a segment.
///
/// The role is connection-wide: a client stamps every segment as initiator,
/// a server as responder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// The side that opened the connection.
    Initiator,
    /// The side that accepted the connection.
    Responder,
}

/// The decoded form of the 8-byte segment header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Sender clock, microseconds, truncated to 32 bits.
    pub time_us: u32,
    /// Which side of the connection sent the segment.
    pub mode: ChannelMode,
    /// The raw mini-protocol identifier. Unknown ids survive decoding so the
    /// caller can decide how to react; see [`SegmentHeader::protocol`].
    pub protocol_id: u16,
    /// Payload size in bytes. Zero-sized segments are legal.
    pub size: u16,
}

impl SegmentHeader {
    /// The encoded size of a segment header.
    pub const LEN: usize = 8;

    /// The largest payload one segment can carry.
    pub const MAX_PAYLOAD: usize = 0xFFFF;

    /// Builds a header for a known mini-protocol.
    pub fn new(time_us: u32, mode: ChannelMode, protocol: MiniProtocol, size: u16) -> Self {
        SegmentHeader {
            time_us,
            mode,
            protocol_id: protocol.id(),
            size,
        }
    }

    /// Encodes the header into its 8-byte wire form.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mode_bit = match self.mode {
            ChannelMode::Initiator => 0,
            ChannelMode::Responder => 1u32 << 31,
        };
        let meta = mode_bit | ((self.protocol_id as u32 & 0x7FFF) << 16) | self.size as u32;
        let mut buf = [0u8; Self::LEN];
        BigEndian::write_u32(&mut buf[..4], self.time_us);
        BigEndian::write_u32(&mut buf[4..], meta);
        buf
    }

    /// Decodes a header from its 8-byte wire form.
    pub fn decode(bytes: [u8; Self::LEN]) -> Self {
        let time_us = BigEndian::read_u32(&bytes[..4]);
        let meta = BigEndian::read_u32(&bytes[4..]);
        let mode = if (meta >> 31) & 1 == 1 {
            ChannelMode::Responder
        } else {
            ChannelMode::Initiator
        };
        SegmentHeader {
            time_us,
            mode,
            protocol_id: ((meta >> 16) & 0x7FFF) as u16,
            size: (meta & 0xFFFF) as u16,
        }
    }

    /// The mini-protocol this segment belongs to, or `None` for identifiers
    /// this crate does not know.
    pub fn protocol(&self) -> Option<MiniProtocol> {
        MiniProtocol::from_id(self.protocol_id)
    }
}

/// Returns the sender clock for outgoing segment headers.
pub fn timestamp_micros() -> u32 {
    // truncation to the low 32 bits is part of the wire format
    chrono::Utc::now().timestamp_micros() as u32
}

/// A framing unit: one header plus its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// The segment header.
    pub header: SegmentHeader,
    /// Exactly `header.size` payload bytes.
    pub payload: Bytes,
}

impl Segment {
    /// Builds a segment around `payload`, refusing payloads that do not fit
    /// the 16-bit size field.
    pub fn from_payload(
        mode: ChannelMode,
        protocol: MiniProtocol,
        payload: Vec<u8>,
    ) -> Result<Self, SerializationError> {
        if payload.len() > SegmentHeader::MAX_PAYLOAD {
            return Err(SerializationError::Parse(
                "segment payload exceeds the 16-bit size field",
            ));
        }
        let header = SegmentHeader::new(timestamp_micros(), mode, protocol, payload.len() as u16);
        Ok(Segment {
            header,
            payload: Bytes::from(payload),
        })
    }
}

#[derive(Debug)]
enum DecodeState {
    Head,
    Body(SegmentHeader),
}

/// A codec which produces segments from byte streams and vice versa.
pub struct SegmentCodec {
    state: DecodeState,
}

impl Default for SegmentCodec {
    fn default() -> Self {
        SegmentCodec {
            state: DecodeState::Head,
        }
    }
}

impl Encoder<Segment> for SegmentCodec {
    type Error = SerializationError;

    fn encode(&mut self, item: Segment, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() != item.header.size as usize {
            return Err(SerializationError::Parse(
                "segment payload does not match the declared size",
            ));
        }
        dst.reserve(SegmentHeader::LEN + item.payload.len());
        dst.extend_from_slice(&item.header.encode());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for SegmentCodec {
    type Item = Segment;
    type Error = SerializationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Head => {
                if src.len() < SegmentHeader::LEN {
                    // Signal that decoding requires more data.
                    return Ok(None);
                }
                let mut bytes = [0u8; SegmentHeader::LEN];
                bytes.copy_from_slice(&src.split_to(SegmentHeader::LEN));
                let header = SegmentHeader::decode(bytes);

                // Reserve buffer space for the expected body and the
                // following header.
                src.reserve(header.size as usize + SegmentHeader::LEN);
                self.state = DecodeState::Body(header);

                // Now that the state is updated, recurse to attempt body
                // decoding.
                self.decode(src)
            }
            DecodeState::Body(header) => {
                if src.len() < header.size as usize {
                    // Need to wait for the full body.
                    return Ok(None);
                }
                let payload = src.split_to(header.size as usize).freeze();
                self.state = DecodeState::Head;
                Ok(Some(Segment { header, payload }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_header_encoding() {
        grevy_test::init();

        let header = SegmentHeader::new(
            0x0123_ABCD,
            ChannelMode::Initiator,
            MiniProtocol::ChainSync,
            12345,
        );
        assert_eq!(hex::encode(header.encode()), "0123abcd00023039");

        let decoded = SegmentHeader::decode(header.encode());
        assert_eq!(decoded.mode, ChannelMode::Initiator);
        assert_eq!(decoded.protocol(), Some(MiniProtocol::ChainSync));
        assert_eq!(decoded.size, 12345);
    }

    #[test]
    fn responder_mode_sets_the_top_bit() {
        grevy_test::init();

        let header =
            SegmentHeader::new(0, ChannelMode::Responder, MiniProtocol::Handshake, 0);
        assert_eq!(header.encode()[4] & 0x80, 0x80);
        assert_eq!(SegmentHeader::decode(header.encode()).mode, ChannelMode::Responder);
    }

    #[test]
    fn unknown_protocol_ids_survive_decoding() {
        grevy_test::init();

        let header = SegmentHeader {
            time_us: 0,
            mode: ChannelMode::Initiator,
            protocol_id: 7,
            size: 0,
        };
        let decoded = SegmentHeader::decode(header.encode());
        assert_eq!(decoded.protocol_id, 7);
        assert_eq!(decoded.protocol(), None);
    }

    #[test]
    fn empty_and_maximum_payloads_are_legal() {
        grevy_test::init();

        let empty = Segment::from_payload(
            ChannelMode::Initiator,
            MiniProtocol::Handshake,
            Vec::new(),
        )
        .expect("empty segments are legal");
        assert_eq!(empty.header.size, 0);

        let max = Segment::from_payload(
            ChannelMode::Initiator,
            MiniProtocol::BlockFetch,
            vec![0u8; SegmentHeader::MAX_PAYLOAD],
        )
        .expect("a full segment is legal");
        assert_eq!(max.header.size as usize, SegmentHeader::MAX_PAYLOAD);

        assert!(Segment::from_payload(
            ChannelMode::Initiator,
            MiniProtocol::BlockFetch,
            vec![0u8; SegmentHeader::MAX_PAYLOAD + 1],
        )
        .is_err());
    }

    #[test]
    fn codec_round_trips_across_partial_reads() {
        grevy_test::init();

        let segment = Segment::from_payload(
            ChannelMode::Responder,
            MiniProtocol::ChainSync,
            b"roll forward".to_vec(),
        )
        .expect("payload fits");

        let mut codec = SegmentCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(segment.clone(), &mut wire).expect("encodes");

        // feed the bytes one at a time; only the final byte completes a frame
        let mut codec = SegmentCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let got = codec.decode(&mut buf).expect("never errors");
            if i + 1 < wire.len() {
                assert!(got.is_none());
            } else {
                decoded = got;
            }
        }
        assert_eq!(decoded.expect("a full frame decodes"), segment);
    }

    proptest! {
        #[test]
        fn header_round_trip(
            time_us in any::<u32>(),
            responder in any::<bool>(),
            protocol_id in 0u16..0x8000,
            size in any::<u16>(),
        ) {
            let header = SegmentHeader {
                time_us,
                mode: if responder { ChannelMode::Responder } else { ChannelMode::Initiator },
                protocol_id,
                size,
            };
            prop_assert_eq!(SegmentHeader::decode(header.encode()), header);
        }
    }
}
