//! Chain-sync message encodings.

use minicbor::{decode, encode, Decoder, Encoder};

use grevy_chain::{FromCbor, Header, Point2, Point3, ToCbor};

/// A chain-sync message; the leading array element is the tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Tag 0: ask for the next header past the intersection.
    RequestNext,
    /// Tag 1: the server is at its tip and has nothing to send yet.
    AwaitReply,
    /// Tag 2: the next header, plus the server's tip.
    RollForward(Header, Point3),
    /// Tag 3: rewind to the given point (or the chain start), plus the tip.
    RollBackward(Option<Point2>, Point3),
    /// Tag 4: probe the given points for the deepest shared one.
    FindIntersect(Vec<Point2>),
    /// Tag 5: the first probed point found locally, plus the tip.
    IntersectFound(Point2, Point3),
    /// Tag 6: none of the probed points is known locally; carries the tip.
    IntersectNotFound(Point3),
    /// Tag 7: the client is finished with this mini-protocol.
    Done,
}

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u64 {
        match self {
            Message::RequestNext => 0,
            Message::AwaitReply => 1,
            Message::RollForward(..) => 2,
            Message::RollBackward(..) => 3,
            Message::FindIntersect(_) => 4,
            Message::IntersectFound(..) => 5,
            Message::IntersectNotFound(_) => 6,
            Message::Done => 7,
        }
    }
}

// An absent rollback target is encoded as a zero-length array.
fn encode_optional_point<W: encode::Write>(
    point: &Option<Point2>,
    e: &mut Encoder<W>,
) -> Result<(), encode::Error<W::Error>> {
    match point {
        Some(p) => p.encode_cbor(e)?,
        None => {
            e.array(0)?;
        }
    }
    Ok(())
}

fn decode_optional_point(d: &mut Decoder<'_>) -> Result<Option<Point2>, decode::Error> {
    match d.array()? {
        Some(0) => Ok(None),
        _ => {
            let slot = d.u64()?;
            let bytes = d.bytes()?;
            let hash = bytes
                .try_into()
                .map_err(|_| decode::Error::message("block hash must be 32 bytes"))?;
            Ok(Some(Point2 {
                slot,
                hash: grevy_chain::BlockHash(hash),
            }))
        }
    }
}

impl ToCbor for Message {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Message::RequestNext => {
                e.array(1)?;
                e.u64(0)?;
            }
            Message::AwaitReply => {
                e.array(1)?;
                e.u64(1)?;
            }
            Message::RollForward(header, tip) => {
                e.array(3)?;
                e.u64(2)?;
                header.encode_cbor(e)?;
                tip.encode_cbor(e)?;
            }
            Message::RollBackward(target, tip) => {
                e.array(3)?;
                e.u64(3)?;
                encode_optional_point(target, e)?;
                tip.encode_cbor(e)?;
            }
            Message::FindIntersect(points) => {
                e.array(2)?;
                e.u64(4)?;
                e.array(points.len() as u64)?;
                for p in points {
                    p.encode_cbor(e)?;
                }
            }
            Message::IntersectFound(point, tip) => {
                e.array(3)?;
                e.u64(5)?;
                point.encode_cbor(e)?;
                tip.encode_cbor(e)?;
            }
            Message::IntersectNotFound(tip) => {
                e.array(2)?;
                e.u64(6)?;
                tip.encode_cbor(e)?;
            }
            Message::Done => {
                e.array(1)?;
                e.u64(7)?;
            }
        }
        Ok(())
    }
}

impl FromCbor for Message {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        match d.u64()? {
            0 => Ok(Message::RequestNext),
            1 => Ok(Message::AwaitReply),
            2 => Ok(Message::RollForward(
                Header::decode_cbor(d)?,
                Point3::decode_cbor(d)?,
            )),
            3 => Ok(Message::RollBackward(
                decode_optional_point(d)?,
                Point3::decode_cbor(d)?,
            )),
            4 => {
                let len = d.array()?.ok_or_else(|| {
                    decode::Error::message("point lists must have a definite length")
                })?;
                let mut points = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    points.push(Point2::decode_cbor(d)?);
                }
                Ok(Message::FindIntersect(points))
            }
            5 => Ok(Message::IntersectFound(
                Point2::decode_cbor(d)?,
                Point3::decode_cbor(d)?,
            )),
            6 => Ok(Message::IntersectNotFound(Point3::decode_cbor(d)?)),
            7 => Ok(Message::Done),
            _ => Err(decode::Error::message("unsupported chain-sync message tag")),
        }
    }
}
