//! The client driver: typed chain operations over one framed connection.
//!
//! A [`Client`] dials lazily: the first operation resolves the address,
//! connects, and negotiates versions. Every inner step runs under the
//! engine's IO deadline, and any failure resets the connection so the next
//! operation starts clean. Other connections are unaffected.

use std::{fmt, ops::RangeInclusive};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use minicbor::Decoder;
use tokio::{
    net::{lookup_host, TcpStream},
    time::timeout,
};
use tracing::{debug, trace, warn};

use grevy_chain::{FromCbor, IntersectionInfo, Point2, Point3, SerializationError, ToCbor};

use crate::{
    constants::IO_TIMEOUT,
    protocol::{
        block_fetch, chain_sync,
        handshake::{self, client_proposal},
        segment::{ChannelMode, MiniProtocol, Segment, SegmentCodec, SegmentHeader},
    },
};

use super::error::ClientError;

use tokio_util::codec::Framed;

type Connection = Framed<TcpStream, SegmentCodec>;

/// A peer's network address, resolved at connection time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerAddr {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One streamed block-fetch reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockResponse {
    /// A single raw block.
    Block(Vec<u8>),
    /// Several consecutive blocks in one compressed payload.
    CompressedBlocks {
        /// The payload encoding id.
        encoding: u64,
        /// The encoded payload.
        payload: Vec<u8>,
    },
}

impl BlockResponse {
    /// Expands the response into raw block bytes; compressed payloads may
    /// hold several concatenated blocks.
    pub fn into_bytes(self) -> Result<Vec<u8>, SerializationError> {
        match self {
            BlockResponse::Block(bytes) => Ok(bytes),
            BlockResponse::CompressedBlocks { encoding, payload } => {
                block_fetch::decode_compressed(encoding, &payload)
            }
        }
    }
}

/// The result of a header fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderFetch {
    /// The intersection the fetch started from, if any.
    pub intersect: Option<Point2>,
    /// The peer's tip at the end of the fetch.
    pub tip: Point3,
    /// The fetched header identities, ascending by slot.
    pub headers: Vec<Point2>,
}

/// A boxed callback receiving streamed blocks; returning `false` stops the
/// stream.
pub type BlockSink = Box<dyn FnMut(BlockResponse) -> bool + Send>;

/// The chain operations a peer offers, abstracted for callers that must be
/// testable against scripted peers.
#[async_trait]
pub trait ChainClient: Send {
    /// Asks the peer for its current tip.
    async fn find_tip(&mut self) -> Result<IntersectionInfo, ClientError>;

    /// Probes `points`, in the given order, for the first one the peer
    /// knows.
    async fn find_intersection(
        &mut self,
        points: Vec<Point2>,
    ) -> Result<IntersectionInfo, ClientError>;

    /// Fetches up to `max` header identities past the best intersection of
    /// `points`.
    async fn fetch_headers(
        &mut self,
        points: Vec<Point2>,
        max: usize,
        allow_empty: bool,
    ) -> Result<HeaderFetch, ClientError>;

    /// Streams the closed range `[from, to]` into `sink`, in wire order.
    async fn fetch_blocks(
        &mut self,
        from: Point2,
        to: Point2,
        sink: BlockSink,
    ) -> Result<(), ClientError>;

    /// Drops the connection; the next operation redials.
    fn reset(&mut self);
}

/// A connection to one upstream peer.
pub struct Client {
    addr: PeerAddr,
    versions: RangeInclusive<u64>,
    magic: u32,
    conn: Option<Connection>,
}

impl Client {
    /// Builds a client for `addr`; nothing is dialled until the first
    /// operation.
    pub fn new(addr: PeerAddr, versions: RangeInclusive<u64>, magic: u32) -> Self {
        Client {
            addr,
            versions,
            magic,
            conn: None,
        }
    }

    /// The peer this client talks to.
    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    /// Drops the connection; the next operation redials and negotiates
    /// again.
    pub fn reset(&mut self) {
        self.conn = None;
    }

    async fn connection(&mut self) -> Result<&mut Connection, ClientError> {
        if self.conn.is_none() {
            let conn = self.dial_and_handshake().await?;
            self.conn = Some(conn);
        }
        Ok(self
            .conn
            .as_mut()
            .expect("the connection was just established"))
    }

    async fn dial_and_handshake(&self) -> Result<Connection, ClientError> {
        let resolved = timeout(IO_TIMEOUT, lookup_host((self.addr.host.as_str(), self.addr.port)))
            .await??
            .next()
            .ok_or_else(|| ClientError::NoAddress(self.addr.to_string()))?;
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(resolved)).await??;
        let mut conn = Framed::new(stream, SegmentCodec::default());
        debug!(addr = %self.addr, "connected, proposing versions");

        let proposal = handshake::Message::ProposeVersions(client_proposal(
            self.versions.clone(),
            self.magic,
        ));
        let reply = Self::request(
            &mut conn,
            MiniProtocol::Handshake,
            proposal.to_cbor_bytes(),
        )
        .await?;
        match handshake::Message::from_cbor_bytes(&reply)? {
            handshake::Message::AcceptVersion(version, _) if self.versions.contains(&version) => {
                debug!(version, "handshake accepted");
                Ok(conn)
            }
            handshake::Message::AcceptVersion(version, _) => {
                Err(ClientError::VersionOutOfRange(version))
            }
            handshake::Message::Refuse(reason) => Err(ClientError::Refused(reason.to_string())),
            other => Err(ClientError::UnexpectedMessage {
                protocol: "handshake",
                tag: other.tag(),
            }),
        }
    }

    async fn request(
        conn: &mut Connection,
        protocol: MiniProtocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        if payload.len() > SegmentHeader::MAX_PAYLOAD {
            return Err(ClientError::Oversized(payload.len()));
        }
        let segment = Segment::from_payload(ChannelMode::Initiator, protocol, payload)?;
        timeout(IO_TIMEOUT, conn.send(segment)).await??;
        Self::read_reply(conn, protocol).await
    }

    async fn read_reply(
        conn: &mut Connection,
        protocol: MiniProtocol,
    ) -> Result<Vec<u8>, ClientError> {
        let segment = timeout(IO_TIMEOUT, conn.next())
            .await?
            .ok_or(ClientError::ConnectionClosed)??;
        if segment.header.mode != ChannelMode::Responder
            || segment.header.protocol() != Some(protocol)
        {
            warn!(
                mode = ?segment.header.mode,
                protocol = segment.header.protocol_id,
                len = segment.payload.len(),
                "unexpected reply segment"
            );
            return Err(ClientError::UnexpectedReply {
                mode: segment.header.mode,
                protocol: segment.header.protocol_id,
            });
        }
        Ok(segment.payload.to_vec())
    }

    async fn find_intersection_inner(
        &mut self,
        points: &[Point2],
    ) -> Result<IntersectionInfo, ClientError> {
        let conn = self.connection().await?;
        let reply = Self::request(
            conn,
            MiniProtocol::ChainSync,
            chain_sync::Message::FindIntersect(points.to_vec()).to_cbor_bytes(),
        )
        .await?;
        match chain_sync::Message::from_cbor_bytes(&reply)? {
            chain_sync::Message::IntersectFound(isect, tip) => Ok(IntersectionInfo {
                isect: Some(isect),
                tip,
            }),
            chain_sync::Message::IntersectNotFound(tip) => {
                Ok(IntersectionInfo { isect: None, tip })
            }
            other => Err(ClientError::UnexpectedMessage {
                protocol: "chain-sync",
                tag: other.tag(),
            }),
        }
    }

    async fn fetch_headers_inner(
        &mut self,
        points: &[Point2],
        max: usize,
        allow_empty: bool,
    ) -> Result<HeaderFetch, ClientError> {
        let mut info = self.find_intersection_inner(points).await?;
        let mut headers: Vec<Point2> = Vec::new();
        let request_next = chain_sync::Message::RequestNext.to_cbor_bytes();

        while headers.len() < max {
            let conn = self.connection().await?;
            let reply =
                Self::request(conn, MiniProtocol::ChainSync, request_next.clone()).await?;
            match chain_sync::Message::from_cbor_bytes(&reply)? {
                chain_sync::Message::AwaitReply => break,
                chain_sync::Message::RollBackward(target, tip) => {
                    info.tip = tip;
                    // a rollback to our own intersection is a no-op
                    if info.isect == target {
                        continue;
                    }
                    break;
                }
                chain_sync::Message::RollForward(header, tip) => {
                    trace!(slot = header.slot, "header received");
                    let point = header.point2();
                    headers.push(point);
                    info.tip = tip;
                    if point.hash == info.tip.hash {
                        break;
                    }
                }
                other => {
                    return Err(ClientError::UnexpectedMessage {
                        protocol: "chain-sync",
                        tag: other.tag(),
                    })
                }
            }
        }

        if headers.is_empty() && !allow_empty && max > 0 {
            return Err(ClientError::EmptyHeaders);
        }
        Ok(HeaderFetch {
            intersect: info.isect,
            tip: info.tip,
            headers,
        })
    }

    async fn fetch_blocks_inner<F>(
        &mut self,
        from: Point2,
        to: Point2,
        handler: &mut F,
    ) -> Result<bool, ClientError>
    where
        F: FnMut(BlockResponse) -> bool + Send,
    {
        let conn = self.connection().await?;
        let reply = Self::request(
            conn,
            MiniProtocol::BlockFetch,
            block_fetch::Message::RequestRange(from, to).to_cbor_bytes(),
        )
        .await?;

        let mut d = Decoder::new(&reply);
        match block_fetch::Message::decode_cbor(&mut d).map_err(SerializationError::from)? {
            block_fetch::Message::StartBatch => {
                let parse_buf = reply[d.position()..].to_vec();
                Self::receive_blocks(conn, parse_buf, handler).await
            }
            block_fetch::Message::NoBlocks => Err(ClientError::NoBlocks),
            other => Err(ClientError::UnexpectedMessage {
                protocol: "block-fetch",
                tag: other.tag(),
            }),
        }
    }

    /// Drains the batch, calling `handler` for each block message in wire
    /// order. Returns whether the batch completed; a handler that stops
    /// early leaves undelivered messages on the connection.
    async fn receive_blocks<F>(
        conn: &mut Connection,
        mut parse_buf: Vec<u8>,
        handler: &mut F,
    ) -> Result<bool, ClientError>
    where
        F: FnMut(BlockResponse) -> bool + Send,
    {
        loop {
            loop {
                if parse_buf.is_empty() {
                    break;
                }
                let mut d = Decoder::new(&parse_buf);
                match block_fetch::Message::decode_cbor(&mut d) {
                    Ok(msg) => {
                        let consumed = d.position();
                        match msg {
                            block_fetch::Message::Block(bytes) => {
                                metrics::counter!(
                                    "grevy.client.block_bytes",
                                    bytes.len() as u64
                                );
                                if !handler(BlockResponse::Block(bytes)) {
                                    return Ok(false);
                                }
                            }
                            block_fetch::Message::CompressedBlocks(encoding, payload) => {
                                metrics::counter!(
                                    "grevy.client.block_bytes",
                                    payload.len() as u64
                                );
                                if !handler(BlockResponse::CompressedBlocks { encoding, payload })
                                {
                                    return Ok(false);
                                }
                            }
                            block_fetch::Message::BatchDone => return Ok(true),
                            other => {
                                return Err(ClientError::UnexpectedMessage {
                                    protocol: "block-fetch",
                                    tag: other.tag(),
                                })
                            }
                        }
                        parse_buf.drain(..consumed);
                    }
                    // a message split across segments; wait for more data
                    Err(e) if e.is_end_of_input() => break,
                    Err(e) => return Err(SerializationError::from(e).into()),
                }
            }
            let more = Self::read_reply(conn, MiniProtocol::BlockFetch).await?;
            parse_buf.extend_from_slice(&more);
        }
    }
}

#[async_trait]
impl ChainClient for Client {
    async fn find_tip(&mut self) -> Result<IntersectionInfo, ClientError> {
        self.find_intersection(Vec::new()).await
    }

    async fn find_intersection(
        &mut self,
        points: Vec<Point2>,
    ) -> Result<IntersectionInfo, ClientError> {
        match self.find_intersection_inner(&points).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn fetch_headers(
        &mut self,
        points: Vec<Point2>,
        max: usize,
        allow_empty: bool,
    ) -> Result<HeaderFetch, ClientError> {
        match self.fetch_headers_inner(&points, max, allow_empty).await {
            Ok(fetch) => Ok(fetch),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn fetch_blocks(
        &mut self,
        from: Point2,
        to: Point2,
        mut sink: BlockSink,
    ) -> Result<(), ClientError> {
        match self.fetch_blocks_inner(from, to, &mut sink).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                // stopping mid-batch leaves the stream desynchronized
                self.reset();
                Ok(())
            }
            // a no-blocks reply is a complete exchange, keep the connection
            Err(e @ ClientError::NoBlocks) => Err(e),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        Client::reset(self);
    }
}
