//! A fair multi-protocol scheduler over one transport.
//!
//! The multiplexer owns the connection's transport and a table of
//! per-protocol handlers. A single logical reader routes ingress segments to
//! handlers; a single logical writer drains handler responses round-robin,
//! one segment at a time, so no mini-protocol can starve the others.
//!
//! Construction requires the handshake handler; the remaining handlers are
//! attached once the handshake reports a negotiated result.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};

use grevy_chain::{SerializationError, ToCbor};

use crate::{
    protocol::handshake::HandshakeResult,
    protocol::segment::{timestamp_micros, ChannelMode, MiniProtocol, SegmentHeader},
    transport::{Transport, TransportError},
};

/// A lazy, finite, non-restartable sequence of outgoing buffers.
///
/// Ownership transfers to the multiplexer on submission. The multiplexer
/// pulls one buffer at a time and only pulls again once the previous buffer
/// has been written out, so a slow transport stalls the producer instead of
/// buffering without bound.
pub type DataGenerator = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Wraps one encoded message as a single-step generator.
pub fn message_generator<M: ToCbor>(msg: &M) -> DataGenerator {
    Box::new(std::iter::once(msg.to_cbor_bytes()))
}

/// An error raised by a protocol handler while processing a message.
///
/// Handler errors are protocol violations: they end that mini-protocol but
/// leave the connection and the other handlers untouched.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message arrived in a state that accepts none.
    #[error("no messages are expected in state {state}, but got {len} bytes")]
    UnexpectedMessage {
        /// The state the handler was in.
        state: &'static str,
        /// The size of the offending payload.
        len: usize,
    },

    /// A message type the current state cannot process.
    #[error("message tag {tag} is not expected in state {state}")]
    UnexpectedTag {
        /// The offending message tag.
        tag: u64,
        /// The state the handler was in.
        state: &'static str,
    },

    /// The payload failed to decode.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A broken invariant inside the handler.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A server-side mini-protocol state machine attached to a multiplexer.
pub trait ProtocolHandler: Send {
    /// Processes one ingress payload, optionally producing a response
    /// generator whose ownership passes to the multiplexer.
    fn data(&mut self, payload: &[u8]) -> Result<Option<DataGenerator>, ProtocolError>;

    /// The negotiated handshake result, once this handler produced one.
    ///
    /// Only the handshake handler ever returns `Some`; the multiplexer polls
    /// this after each handshake dispatch to attach the remaining handlers.
    fn negotiated(&self) -> Option<HandshakeResult> {
        None
    }

    /// Called at most once, when the connection fails. No calls follow.
    fn failed(&mut self, reason: &str);

    /// Called at most once, when the connection is cancelled. No calls
    /// follow.
    fn stopped(&mut self);
}

/// Builds one protocol handler for a connection, given the negotiated
/// handshake result. The handshake factory receives a placeholder result.
pub type HandlerFactory = Box<dyn Fn(&HandshakeResult) -> Box<dyn ProtocolHandler> + Send + Sync>;

/// The handler set wired onto each connection.
#[derive(Default)]
pub struct MultiplexerConfig {
    handlers: BTreeMap<MiniProtocol, HandlerFactory>,
}

impl MultiplexerConfig {
    /// An empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler factory, replacing any previous entry for `protocol`.
    pub fn with_handler(mut self, protocol: MiniProtocol, factory: HandlerFactory) -> Self {
        self.handlers.insert(protocol, factory);
        self
    }

    /// The number of configured protocols.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no protocols are configured.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// The observable state of a connection.
///
/// The state is monotone: `Active` can become `Stopped` or `Failed`, and a
/// failure is never overwritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection is working.
    Active,
    /// The connection was cancelled by the application.
    Stopped,
    /// The connection failed; the payload is the first error observed.
    Failed(String),
}

/// A shared slot holding the connection state, with first-failure-wins
/// updates.
struct StateSlot(Mutex<ConnectionState>);

impl StateSlot {
    fn new() -> Self {
        StateSlot(Mutex::new(ConnectionState::Active))
    }

    fn get(&self) -> ConnectionState {
        self.0.lock().expect("state mutex poisoned").clone()
    }

    /// Records a failure unless one is already latched. Overrides `Stopped`.
    fn try_fail(&self, reason: &str) -> bool {
        let mut guard = self.0.lock().expect("state mutex poisoned");
        if matches!(*guard, ConnectionState::Failed(_)) {
            warn!(reason, "a failure on a connection that has already failed");
            return false;
        }
        *guard = ConnectionState::Failed(reason.to_string());
        true
    }

    /// Records a cancellation, only from the active state.
    fn try_stop(&self) -> bool {
        let mut guard = self.0.lock().expect("state mutex poisoned");
        if *guard != ConnectionState::Active {
            warn!("a broken connection has been additionally cancelled");
            return false;
        }
        *guard = ConnectionState::Stopped;
        true
    }
}

/// An error from the multiplexer itself.
#[derive(Error, Debug)]
pub enum MultiplexerError {
    /// The configuration has no handshake handler.
    #[error("a multiplexer config must include a handshake handler")]
    MissingHandshake,

    /// The connection has failed; the payload is the first error observed.
    #[error("the communication channel has failed: {0}")]
    Failed(String),

    /// The connection has been cancelled.
    #[error("the communication channel has been stopped")]
    Stopped,

    /// A peer sent traffic for a protocol with no handler.
    #[error("a client has requested an unsupported mini protocol: {0}")]
    UnknownProtocol(u16),

    /// Two factories produced the same mini-protocol.
    #[error("mini protocol {0} has already been registered with the connection")]
    DuplicateProtocol(MiniProtocol),

    /// A handler produced a reply while its previous reply was still being
    /// sent.
    #[error("mini protocol {0} cannot schedule a submission while another one is in progress")]
    SubmissionInProgress(MiniProtocol),

    /// A generator yielded an empty buffer, which would stall the writer.
    #[error("a data generator returned an empty buffer")]
    EmptyGeneratorStep,
}

struct ProtocolData {
    handler: Box<dyn ProtocolHandler>,
    busy: AtomicBool,
    generator: Option<DataGenerator>,
    // the last buffer pulled from the generator, minus what was already sent
    buffer: Vec<u8>,
}

impl ProtocolData {
    fn new(handler: Box<dyn ProtocolHandler>) -> Self {
        ProtocolData {
            handler,
            busy: AtomicBool::new(false),
            generator: None,
            buffer: Vec::new(),
        }
    }
}

/// The multiplexer: one transport, many mini-protocols.
pub struct Multiplexer {
    transport: Box<dyn Transport>,
    role: ChannelMode,
    config: Arc<MultiplexerConfig>,
    protocols: BTreeMap<MiniProtocol, ProtocolData>,
    egress_ready: AtomicUsize,
    state: StateSlot,
    egress_cursor: Option<MiniProtocol>,
    handlers_notified: bool,
    handshake_done: bool,
}

impl Multiplexer {
    /// Builds a multiplexer over `transport` with the given handler set.
    ///
    /// The handshake handler is instantiated immediately; the rest are
    /// attached once negotiation succeeds.
    pub fn new(
        transport: Box<dyn Transport>,
        config: Arc<MultiplexerConfig>,
        role: ChannelMode,
    ) -> Result<Self, MultiplexerError> {
        let handshake_factory = config
            .handlers
            .get(&MiniProtocol::Handshake)
            .ok_or(MultiplexerError::MissingHandshake)?;
        let handler = handshake_factory(&HandshakeResult::default());

        let mut protocols = BTreeMap::new();
        protocols.insert(MiniProtocol::Handshake, ProtocolData::new(handler));

        Ok(Multiplexer {
            transport,
            role,
            config,
            protocols,
            egress_ready: AtomicUsize::new(0),
            state: StateSlot::new(),
            egress_cursor: None,
            handlers_notified: false,
            handshake_done: false,
        })
    }

    /// The connection's observable state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether the connection is still working.
    pub fn alive(&self) -> bool {
        self.state.get() == ConnectionState::Active
    }

    fn check_state(&self) -> Result<(), MultiplexerError> {
        match self.state.get() {
            ConnectionState::Active => Ok(()),
            ConnectionState::Stopped => Err(MultiplexerError::Stopped),
            ConnectionState::Failed(err) => Err(MultiplexerError::Failed(err)),
        }
    }

    /// Submits a generator for `protocol`.
    ///
    /// Atomically takes the protocol's busy flag and preloads one step.
    /// Returns `Ok(false)`, without taking ownership of the submission slot,
    /// if the protocol is unknown, still sending, or the generator is empty.
    pub fn try_send(
        &mut self,
        protocol: MiniProtocol,
        generator: DataGenerator,
    ) -> Result<bool, MultiplexerError> {
        self.check_state()?;
        let Some(data) = self.protocols.get_mut(&protocol) else {
            return Ok(false);
        };
        if data.busy.load(Ordering::Relaxed) {
            return Ok(false);
        }
        if data
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(false);
        }

        data.buffer.clear();
        let mut generator = generator;
        match generator.next() {
            Some(first) => {
                data.buffer = first;
                data.generator = Some(generator);
                self.egress_ready.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => {
                data.generator = None;
                data.busy.store(false, Ordering::Release);
                Ok(false)
            }
        }
    }

    /// Submits a single pre-encoded buffer for `protocol`.
    pub fn try_send_bytes(
        &mut self,
        protocol: MiniProtocol,
        bytes: Vec<u8>,
    ) -> Result<bool, MultiplexerError> {
        self.try_send(protocol, Box::new(std::iter::once(bytes)))
    }

    /// Whether any protocol has egress waiting to be written.
    pub fn available_egress(&self) -> bool {
        self.egress_ready.load(Ordering::Relaxed) > 0
    }

    /// Whether the transport reports ingress waiting to be read.
    pub fn available_ingress(&self) -> bool {
        self.transport.available_ingress() > 0
    }

    /// Waits, without a deadline, until ingress is likely to be readable.
    pub async fn wait_ingress(&mut self) -> Result<(), MultiplexerError> {
        self.check_state()?;
        match self.transport.wait_readable().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.latch_transport_error(e)),
        }
    }

    /// Writes at most one segment, rotating fairly across protocols with
    /// pending egress.
    pub async fn process_egress(&mut self) -> Result<(), MultiplexerError> {
        self.check_state()?;
        let keys: Vec<MiniProtocol> = self.protocols.keys().copied().collect();
        let start = match self.egress_cursor {
            Some(cursor) => keys
                .iter()
                .position(|k| *k == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        for offset in 0..keys.len() {
            let key = keys[(start + offset) % keys.len()];
            let ready = {
                let data = &self.protocols[&key];
                // once the buffer is non-empty, the sender owns the resource
                data.busy.load(Ordering::Acquire) && !data.buffer.is_empty()
            };
            if ready {
                self.egress_cursor = Some(key);
                return self.send_packet(key).await;
            }
        }
        Ok(())
    }

    async fn send_packet(&mut self, key: MiniProtocol) -> Result<(), MultiplexerError> {
        let Some(data) = self.protocols.get(&key) else {
            return Ok(());
        };
        let size = data.buffer.len().min(SegmentHeader::MAX_PAYLOAD);
        let header = SegmentHeader::new(timestamp_micros(), self.role, key, size as u16);
        let mut packet = Vec::with_capacity(SegmentHeader::LEN + size);
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(&data.buffer[..size]);

        if let Err(e) = self.transport.write_all(&packet).await {
            return Err(self.latch_transport_error(e));
        }

        let Some(data) = self.protocols.get_mut(&key) else {
            return Ok(());
        };
        data.buffer.drain(..size);
        if data.buffer.is_empty() {
            match data.generator.as_mut().and_then(|g| g.next()) {
                Some(next) if next.is_empty() => {
                    let err = MultiplexerError::EmptyGeneratorStep;
                    self.latch_failure(&err.to_string());
                    return Err(err);
                }
                Some(next) => data.buffer = next,
                None => {
                    data.generator = None;
                    data.busy.store(false, Ordering::Release);
                    self.egress_ready.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Reads exactly one segment and dispatches it to its handler.
    pub async fn process_ingress(&mut self) -> Result<(), MultiplexerError> {
        self.check_state()?;

        let mut header_bytes = [0u8; SegmentHeader::LEN];
        if let Err(e) = self.transport.read_exact(&mut header_bytes).await {
            return Err(self.latch_transport_error(e));
        }
        let header = SegmentHeader::decode(header_bytes);

        let mut payload = vec![0u8; header.size as usize];
        if header.size > 0 {
            if let Err(e) = self.transport.read_exact(&mut payload).await {
                return Err(self.latch_transport_error(e));
            }
        }

        let Some(protocol) = header.protocol() else {
            return Err(self.latch_unknown_protocol(header.protocol_id));
        };
        let Some(data) = self.protocols.get_mut(&protocol) else {
            return Err(self.latch_unknown_protocol(header.protocol_id));
        };

        match data.handler.data(&payload) {
            Ok(Some(generator)) => {
                if !self.try_send(protocol, generator)? {
                    let err = MultiplexerError::SubmissionInProgress(protocol);
                    self.latch_failure(&err.to_string());
                    return Err(err);
                }
            }
            Ok(None) => {}
            Err(e) => {
                // a protocol violation ends this mini-protocol but leaves
                // the connection and the other handlers alive
                warn!(%protocol, error = %e, "mini-protocol violation");
                return Ok(());
            }
        }

        if protocol == MiniProtocol::Handshake && !self.handshake_done {
            let negotiated = self
                .protocols
                .get(&MiniProtocol::Handshake)
                .and_then(|data| data.handler.negotiated());
            if let Some(result) = negotiated {
                self.handshake_done = true;
                self.attach_handlers(&result)?;
            }
        }
        Ok(())
    }

    /// Closes the underlying transport. Errors are ignored; the connection
    /// is already terminal when this is called.
    pub async fn close(&mut self) {
        let _ = self.transport.close().await;
    }

    /// Cancels the connection and notifies every handler once.
    pub fn stop(&mut self) {
        if self.state.try_stop() && !self.handlers_notified {
            self.handlers_notified = true;
            for data in self.protocols.values_mut() {
                data.handler.stopped();
            }
        }
    }

    fn attach_handlers(&mut self, result: &HandshakeResult) -> Result<(), MultiplexerError> {
        info!(version = result.version, "handshake succeeded");
        let config = self.config.clone();
        for (protocol, factory) in &config.handlers {
            if *protocol == MiniProtocol::Handshake {
                continue;
            }
            let handler = factory(result);
            match self.protocols.entry(*protocol) {
                Entry::Vacant(slot) => {
                    debug!(%protocol, "attached mini-protocol handler");
                    slot.insert(ProtocolData::new(handler));
                }
                Entry::Occupied(_) => {
                    return Err(MultiplexerError::DuplicateProtocol(*protocol));
                }
            }
        }
        Ok(())
    }

    fn latch_unknown_protocol(&mut self, id: u16) -> MultiplexerError {
        let err = MultiplexerError::UnknownProtocol(id);
        self.latch_failure(&err.to_string());
        err
    }

    fn latch_transport_error(&mut self, e: TransportError) -> MultiplexerError {
        match e {
            TransportError::Stopped => {
                self.latch_stop();
                MultiplexerError::Stopped
            }
            other => {
                let msg = other.to_string();
                self.latch_failure(&msg);
                MultiplexerError::Failed(msg)
            }
        }
    }

    fn latch_failure(&mut self, reason: &str) {
        if self.state.try_fail(reason) && !self.handlers_notified {
            self.handlers_notified = true;
            for data in self.protocols.values_mut() {
                data.handler.failed(reason);
            }
        }
    }

    fn latch_stop(&mut self) {
        if self.state.try_stop() && !self.handlers_notified {
            self.handlers_notified = true;
            for data in self.protocols.values_mut() {
                data.handler.stopped();
            }
        }
    }
}
