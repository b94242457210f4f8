//! The server side of the handshake mini-protocol.

use tracing::debug;

use grevy_chain::FromCbor;

use crate::multiplexer::{message_generator, DataGenerator, ProtocolError, ProtocolHandler};

use super::{
    message::{Message, RefuseReason, VersionData, VersionMap},
    HandshakeResult, VersionTable,
};

#[derive(Copy, Clone, Debug)]
enum State {
    Propose,
    Confirm,
    Done,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Propose => "propose",
            State::Confirm => "confirm",
            State::Done => "done",
        }
    }
}

/// Negotiates one version proposal and reports the outcome.
pub struct HandshakeHandler {
    table: VersionTable,
    state: State,
    result: Option<HandshakeResult>,
}

impl HandshakeHandler {
    /// Builds a handler offering the versions in `table`.
    pub fn new(table: VersionTable) -> Self {
        HandshakeHandler {
            table,
            state: State::Propose,
            result: None,
        }
    }

    fn confirm(&mut self, proposal: VersionMap) -> Message {
        // the proposal map is ordered, so the last shared key is the best
        let shared: Vec<u64> = proposal
            .keys()
            .filter(|v| self.table.contains(**v))
            .copied()
            .collect();
        let Some(best) = shared.last().copied() else {
            return Message::Refuse(RefuseReason::VersionMismatch(self.table.version_numbers()));
        };

        let Some(requested) = proposal.get(&best) else {
            return Message::Refuse(RefuseReason::DecodeError(
                self.table.promoted(),
                "invalid encoding".to_string(),
            ));
        };
        let Some(offered) = self.table.get(best) else {
            return Message::Refuse(RefuseReason::VersionMismatch(self.table.version_numbers()));
        };

        if requested.network_magic != offered.network_magic {
            return Message::Refuse(RefuseReason::Refused(
                self.table.promoted(),
                format!(
                    "the proposed magic is not supported: req: {} have: {}",
                    requested.network_magic, offered.network_magic
                ),
            ));
        }
        if !requested.initiator_only_diffusion {
            return Message::Refuse(RefuseReason::Refused(
                self.table.promoted(),
                "a negative initiator_only_diffusion_mode is not supported".to_string(),
            ));
        }
        if requested.peer_sharing != 0 {
            return Message::Refuse(RefuseReason::Refused(
                self.table.promoted(),
                "peer_sharing is not supported".to_string(),
            ));
        }
        if requested.query {
            return Message::QueryReply(self.table.versions().clone());
        }

        let result = HandshakeResult {
            version: best,
            data: VersionData {
                network_magic: offered.network_magic,
                initiator_only_diffusion: requested.initiator_only_diffusion,
                peer_sharing: requested.peer_sharing,
                query: false,
            },
        };
        self.result = Some(result.clone());
        Message::AcceptVersion(result.version, result.data)
    }
}

impl ProtocolHandler for HandshakeHandler {
    fn data(&mut self, payload: &[u8]) -> Result<Option<DataGenerator>, ProtocolError> {
        if !matches!(self.state, State::Propose) {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state.name(),
                len: payload.len(),
            });
        }
        self.state = State::Confirm;

        // the server must ignore unsupported parameters of newer versions,
        // so anything that fails to decode is refused, not dropped
        let reply = match Message::from_cbor_bytes(payload) {
            Ok(Message::ProposeVersions(proposal)) => self.confirm(proposal),
            Ok(_) | Err(_) => Message::Refuse(RefuseReason::DecodeError(
                self.table.promoted(),
                "invalid encoding".to_string(),
            )),
        };
        debug!(tag = reply.tag(), "handshake response");
        self.state = State::Done;
        Ok(Some(message_generator(&reply)))
    }

    fn negotiated(&self) -> Option<HandshakeResult> {
        self.result.clone()
    }

    fn failed(&mut self, _reason: &str) {
        self.state = State::Done;
    }

    fn stopped(&mut self) {
        self.state = State::Done;
    }
}
