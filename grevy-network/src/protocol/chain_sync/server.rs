//! The server side of the chain-sync mini-protocol.

use std::sync::Arc;

use tracing::trace;

use grevy_chain::{ChunkRegistry, FromCbor, NetworkParameters, Point2, Point3};

use crate::multiplexer::{message_generator, DataGenerator, ProtocolError, ProtocolHandler};

use super::message::Message;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Intersect,
    CanAwait,
    MustReply,
    Done,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Intersect => "intersect",
            State::CanAwait => "can_await",
            State::MustReply => "must_reply",
            State::Done => "done",
        }
    }
}

/// Serves intersection probes and header streaming from the local archive.
pub struct ChainSyncHandler {
    registry: Arc<dyn ChunkRegistry>,
    params: NetworkParameters,
    state: State,
    // the cursor: the last point the peer has seen
    isect: Option<Point2>,
}

impl ChainSyncHandler {
    /// Builds a handler serving from `registry`.
    pub fn new(registry: Arc<dyn ChunkRegistry>, params: NetworkParameters) -> Self {
        ChainSyncHandler {
            registry,
            params,
            state: State::Idle,
            isect: None,
        }
    }

    fn genesis_tip(&self) -> Point3 {
        Point3 {
            slot: 0,
            hash: self.params.genesis_hash,
            height: 0,
        }
    }

    fn tip(&self) -> Result<Point3, ProtocolError> {
        self.registry
            .tip()
            .ok_or_else(|| ProtocolError::Internal("a non-empty chain has no tip".to_string()))
    }

    fn find_intersect(&mut self, points: Vec<Point2>) -> Result<Message, ProtocolError> {
        self.state = State::Intersect;
        for point in &points {
            if let Some(info) = self.registry.find_block_by_slot(point.slot, &point.hash) {
                trace!(slot = info.point.slot, "intersection found");
                self.isect = Some(info.point);
                return Ok(Message::IntersectFound(info.point, self.tip()?));
            }
        }
        let tip = self.registry.tip().unwrap_or_else(|| self.genesis_tip());
        Ok(Message::IntersectNotFound(tip))
    }

    fn request_next(&mut self) -> Result<Message, ProtocolError> {
        self.state = State::CanAwait;
        // stream from the chain start unless the peer has seen a block
        let pos = match &self.isect {
            Some(point) => {
                let found = self.registry.find_block(point).ok_or_else(|| {
                    ProtocolError::Internal("cannot find the intersection block".to_string())
                })?;
                found + 1
            }
            None => 0,
        };
        match self.registry.header(pos) {
            Some(header) => {
                self.isect = Some(header.point2());
                Ok(Message::RollForward(header, self.tip()?))
            }
            None => Ok(Message::AwaitReply),
        }
    }
}

impl ProtocolHandler for ChainSyncHandler {
    fn data(&mut self, payload: &[u8]) -> Result<Option<DataGenerator>, ProtocolError> {
        if self.state != State::Idle {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state.name(),
                len: payload.len(),
            });
        }
        let msg = Message::from_cbor_bytes(payload).map_err(|e| {
            self.state = State::Done;
            ProtocolError::Serialization(e)
        })?;

        let reply = match msg {
            Message::FindIntersect(points) => self.find_intersect(points)?,
            Message::RequestNext => self.request_next()?,
            other => {
                self.state = State::Done;
                return Err(ProtocolError::UnexpectedTag {
                    tag: other.tag(),
                    state: "idle",
                });
            }
        };

        self.state = match reply {
            Message::AwaitReply => State::MustReply,
            _ => State::Idle,
        };
        Ok(Some(message_generator(&reply)))
    }

    fn failed(&mut self, _reason: &str) {
        self.state = State::Done;
    }

    fn stopped(&mut self) {
        self.state = State::Done;
    }
}
