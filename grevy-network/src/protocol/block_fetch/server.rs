//! The server side of the block-fetch mini-protocol.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use grevy_chain::{ChunkRegistry, FromCbor, ToCbor};

use crate::multiplexer::{message_generator, DataGenerator, ProtocolError, ProtocolHandler};

use super::message::{Message, ENCODING_ZSTD};

/// Configuration for one block-fetch handler.
#[derive(Copy, Clone, Debug, Default)]
pub struct BlockFetchConfig {
    /// Whether batches may be served as compressed chunk slices.
    pub block_compression: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Busy,
    Streaming,
    Done,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Busy => "busy",
            State::Streaming => "streaming",
            State::Done => "done",
        }
    }
}

/// Serves closed block ranges from the local archive.
pub struct BlockFetchHandler {
    registry: Arc<dyn ChunkRegistry>,
    config: BlockFetchConfig,
    // shared with the in-flight batch generator, which returns the protocol
    // to idle after its final message
    state: Arc<Mutex<State>>,
}

impl BlockFetchHandler {
    /// Builds a handler serving from `registry`.
    pub fn new(registry: Arc<dyn ChunkRegistry>, config: BlockFetchConfig) -> Self {
        debug!(
            block_compression = config.block_compression,
            "created block-fetch handler"
        );
        BlockFetchHandler {
            registry,
            config,
            state: Arc::new(Mutex::new(State::Idle)),
        }
    }

    fn set_state(&self, state: State) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }
}

impl ProtocolHandler for BlockFetchHandler {
    fn data(&mut self, payload: &[u8]) -> Result<Option<DataGenerator>, ProtocolError> {
        let state = *self.state.lock().expect("state mutex poisoned");
        if state != State::Idle {
            return Err(ProtocolError::UnexpectedMessage {
                state: state.name(),
                len: payload.len(),
            });
        }
        let msg = Message::from_cbor_bytes(payload)?;

        match msg {
            Message::ClientDone => {
                self.set_state(State::Done);
                Ok(None)
            }
            Message::RequestRange(from, to) => {
                self.set_state(State::Busy);
                debug!(from_slot = from.slot, to_slot = to.slot, "block-fetch range");

                let Some(start) = self.registry.find_block(&from) else {
                    self.set_state(State::Idle);
                    return Ok(Some(message_generator(&Message::NoBlocks)));
                };
                let Some(last) = self.registry.find_block(&to) else {
                    self.set_state(State::Idle);
                    return Ok(Some(message_generator(&Message::NoBlocks)));
                };

                self.set_state(State::Streaming);
                Ok(Some(Box::new(BatchStream {
                    registry: self.registry.clone(),
                    state: self.state.clone(),
                    compression: self.config.block_compression,
                    pos: start,
                    end: last + 1,
                    phase: Phase::Start,
                })))
            }
            other => {
                self.set_state(State::Done);
                Err(ProtocolError::UnexpectedTag {
                    tag: other.tag(),
                    state: "idle",
                })
            }
        }
    }

    fn failed(&mut self, _reason: &str) {
        self.set_state(State::Done);
    }

    fn stopped(&mut self) {
        self.set_state(State::Done);
    }
}

enum Phase {
    Start,
    Blocks,
    Finished,
}

/// Lazily walks the archive, one message per pull, so the transport's pace
/// bounds how much block data sits in memory.
struct BatchStream {
    registry: Arc<dyn ChunkRegistry>,
    state: Arc<Mutex<State>>,
    compression: bool,
    pos: usize,
    end: usize,
    phase: Phase,
}

impl Iterator for BatchStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        match self.phase {
            Phase::Start => {
                self.phase = Phase::Blocks;
                Some(Message::StartBatch.to_cbor_bytes())
            }
            Phase::Blocks => {
                if self.pos >= self.end {
                    self.phase = Phase::Finished;
                    *self.state.lock().expect("state mutex poisoned") = State::Idle;
                    return Some(Message::BatchDone.to_cbor_bytes());
                }
                if self.compression {
                    // batches split at stored chunk boundaries, so whole
                    // chunk remainders are served without recompression
                    match self.registry.chunk_remaining_data(self.pos, self.end) {
                        Ok((payload, next)) => {
                            self.pos = next;
                            Some(Message::CompressedBlocks(ENCODING_ZSTD, payload).to_cbor_bytes())
                        }
                        Err(e) => {
                            error!(pos = self.pos, error = %e, "batch stream lost its chunk");
                            self.phase = Phase::Finished;
                            None
                        }
                    }
                } else {
                    match self.registry.block_data(self.pos) {
                        Some(bytes) => {
                            self.pos += 1;
                            Some(Message::Block(bytes).to_cbor_bytes())
                        }
                        None => {
                            error!(pos = self.pos, "batch stream lost its block");
                            self.phase = Phase::Finished;
                            None
                        }
                    }
                }
            }
            Phase::Finished => None,
        }
    }
}
