//! Handshake message encodings.

use std::{collections::BTreeMap, fmt};

use minicbor::{decode, encode, Decoder, Encoder};

use grevy_chain::{FromCbor, ToCbor};

/// The negotiable parameters attached to each protocol version.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionData {
    /// The network this node belongs to.
    pub network_magic: u32,
    /// Whether the proposing side will only ever initiate connections.
    /// Servers require this from clients.
    pub initiator_only_diffusion: bool,
    /// Peer-sharing participation level. Servers only accept 0.
    pub peer_sharing: u8,
    /// When set in a proposal, the server replies with its version map
    /// instead of accepting.
    pub query: bool,
}

impl ToCbor for VersionData {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(4)?;
        e.u32(self.network_magic)?;
        e.bool(self.initiator_only_diffusion)?;
        e.u8(self.peer_sharing)?;
        e.bool(self.query)?;
        Ok(())
    }
}

impl FromCbor for VersionData {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        Ok(VersionData {
            network_magic: d.u32()?,
            initiator_only_diffusion: d.bool()?,
            peer_sharing: d.u8()?,
            query: d.bool()?,
        })
    }
}

/// An ordered map from version number to its negotiable parameters.
pub type VersionMap = BTreeMap<u64, VersionData>;

fn encode_version_map<W: encode::Write>(
    map: &VersionMap,
    e: &mut Encoder<W>,
) -> Result<(), encode::Error<W::Error>> {
    e.map(map.len() as u64)?;
    for (version, data) in map {
        e.u64(*version)?;
        data.encode_cbor(e)?;
    }
    Ok(())
}

fn decode_version_map(d: &mut Decoder<'_>) -> Result<VersionMap, decode::Error> {
    let len = d
        .map()?
        .ok_or_else(|| decode::Error::message("version maps must have a definite length"))?;
    let mut map = VersionMap::new();
    for _ in 0..len {
        let version = d.u64()?;
        let data = VersionData::decode_cbor(d)?;
        map.insert(version, data);
    }
    Ok(map)
}

/// Why a proposal was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefuseReason {
    /// No common version; carries the refusing side's version numbers.
    VersionMismatch(Vec<u64>),
    /// The proposal could not be decoded under the quoted version's rules.
    DecodeError(u64, String),
    /// The version was common but its parameters were not acceptable.
    Refused(u64, String),
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::VersionMismatch(versions) => {
                write!(f, "version mismatch, peer supports {versions:?}")
            }
            RefuseReason::DecodeError(version, msg) => {
                write!(f, "decode error at version {version}: {msg}")
            }
            RefuseReason::Refused(version, msg) => {
                write!(f, "refused at version {version}: {msg}")
            }
        }
    }
}

impl RefuseReason {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            RefuseReason::VersionMismatch(versions) => {
                e.array(2)?;
                e.u64(0)?;
                e.array(versions.len() as u64)?;
                for v in versions {
                    e.u64(*v)?;
                }
            }
            RefuseReason::DecodeError(version, msg) => {
                e.array(3)?;
                e.u64(1)?;
                e.u64(*version)?;
                e.str(msg)?;
            }
            RefuseReason::Refused(version, msg) => {
                e.array(3)?;
                e.u64(2)?;
                e.u64(*version)?;
                e.str(msg)?;
            }
        }
        Ok(())
    }

    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        match d.u64()? {
            0 => {
                let len = d.array()?.ok_or_else(|| {
                    decode::Error::message("version lists must have a definite length")
                })?;
                let mut versions = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    versions.push(d.u64()?);
                }
                Ok(RefuseReason::VersionMismatch(versions))
            }
            1 => Ok(RefuseReason::DecodeError(d.u64()?, d.str()?.to_string())),
            2 => Ok(RefuseReason::Refused(d.u64()?, d.str()?.to_string())),
            _ => Err(decode::Error::message("unsupported refuse reason tag")),
        }
    }
}

/// A handshake message; the leading array element is the tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Tag 0: the client's proposed version map.
    ProposeVersions(VersionMap),
    /// Tag 1: the server accepted a version with these parameters.
    AcceptVersion(u64, VersionData),
    /// Tag 2: the server refused the proposal.
    Refuse(RefuseReason),
    /// Tag 3: the server answered a query with its version map.
    QueryReply(VersionMap),
}

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u64 {
        match self {
            Message::ProposeVersions(_) => 0,
            Message::AcceptVersion(..) => 1,
            Message::Refuse(_) => 2,
            Message::QueryReply(_) => 3,
        }
    }
}

impl ToCbor for Message {
    fn encode_cbor<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Message::ProposeVersions(map) => {
                e.array(2)?;
                e.u64(0)?;
                encode_version_map(map, e)?;
            }
            Message::AcceptVersion(version, data) => {
                e.array(3)?;
                e.u64(1)?;
                e.u64(*version)?;
                data.encode_cbor(e)?;
            }
            Message::Refuse(reason) => {
                e.array(2)?;
                e.u64(2)?;
                reason.encode_cbor(e)?;
            }
            Message::QueryReply(map) => {
                e.array(2)?;
                e.u64(3)?;
                encode_version_map(map, e)?;
            }
        }
        Ok(())
    }
}

impl FromCbor for Message {
    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, decode::Error> {
        d.array()?;
        match d.u64()? {
            0 => Ok(Message::ProposeVersions(decode_version_map(d)?)),
            1 => Ok(Message::AcceptVersion(
                d.u64()?,
                VersionData::decode_cbor(d)?,
            )),
            2 => Ok(Message::Refuse(RefuseReason::decode_cbor(d)?)),
            3 => Ok(Message::QueryReply(decode_version_map(d)?)),
            _ => Err(decode::Error::message(
                "unsupported handshake message tag",
            )),
        }
    }
}
