//! The download pipeline: ordering streamed blocks into chunks and handing
//! them to the chunk registry.
//!
//! The pipeline holds one open in-memory chunk. When an incoming block
//! belongs to a new chunk id, the open chunk is flushed: compressed on the
//! blocking pool (unless it arrived pre-compressed and covers the chunk
//! exactly) and committed to the registry. A validation failure latches a
//! watermark that cancels queued commits at or above the failing offset.

use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use grevy_chain::{
    chunk_id, registry::compress_chunk, ChunkError, ChunkRegistry, NetworkParameters, ParsedBlock,
    Point2,
};
use grevy_network::{protocol::block_fetch::ENCODING_ZSTD, BlockResponse, BlockSink, ChainClient};

use crate::{
    peer_info::PeerInfo,
    progress::{Progress, ProgressSink, TracingProgress},
    SyncError,
};

/// The lowest chain offset known to be invalid, if any.
///
/// Cancellation is idempotent: the watermark only ever moves down, and work
/// whose data reaches at or past it is skipped instead of dispatched.
pub struct Watermark(Mutex<Option<u64>>);

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}

impl Watermark {
    /// A watermark with no failure recorded.
    pub fn new() -> Self {
        Watermark(Mutex::new(None))
    }

    /// Records a validation failure at `max_valid_offset`.
    pub fn cancel(&self, max_valid_offset: u64) {
        let mut guard = self.0.lock().expect("watermark lock poisoned");
        if guard.map_or(true, |w| max_valid_offset < w) {
            warn!(
                offset = max_valid_offset,
                "validation failure, cancelling queued work above the watermark"
            );
            *guard = Some(max_valid_offset);
        }
    }

    /// The current watermark.
    pub fn get(&self) -> Option<u64> {
        *self.0.lock().expect("watermark lock poisoned")
    }

    /// Whether data spanning `[offset, offset + len)` is still valid.
    pub fn allows(&self, offset: u64, len: u64) -> bool {
        self.get().map_or(true, |w| offset + len <= w)
    }

    fn reset(&self) {
        *self.0.lock().expect("watermark lock poisoned") = None;
    }
}

/// Groups downloaded blocks into chunks and commits them to the registry.
pub struct ChunkWriter {
    registry: Arc<dyn ChunkRegistry>,
    epoch_length: u64,
    open: Vec<u8>,
    open_chunk_id: Option<u64>,
    open_last_slot: Option<u64>,
    // a received artifact that is byte-for-byte the open chunk
    precompressed: Option<Vec<u8>>,
    next_offset: u64,
    watermark: Arc<Watermark>,
    tasks: JoinSet<Result<(), ChunkError>>,
    progress: Arc<dyn ProgressSink>,
}

impl ChunkWriter {
    /// Builds a writer appending at `start_offset`.
    pub fn new(
        registry: Arc<dyn ChunkRegistry>,
        epoch_length: u64,
        start_offset: u64,
        watermark: Arc<Watermark>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        ChunkWriter {
            registry,
            epoch_length,
            open: Vec::new(),
            open_chunk_id: None,
            open_last_slot: None,
            precompressed: None,
            next_offset: start_offset,
            watermark,
            tasks: JoinSet::new(),
            progress,
        }
    }

    /// The offset one past everything appended so far, committed or open.
    pub fn end_offset(&self) -> u64 {
        self.next_offset + self.open.len() as u64
    }

    fn roll_over(&mut self, id: u64) {
        if self.open_chunk_id != Some(id) {
            if self.open_chunk_id.is_some() {
                info!(chunk = id, "block from a new chunk");
            }
            self.flush();
            self.open_chunk_id = Some(id);
        }
    }

    /// Appends one block, flushing the open chunk when the chunk id changes.
    pub fn add_block(&mut self, block: &ParsedBlock) {
        self.roll_over(chunk_id(block.slot(), self.epoch_length));
        self.open.extend_from_slice(block.bytes());
        self.open_last_slot = Some(block.slot());
        self.precompressed = None;
        self.progress.report(
            "download",
            Progress {
                slot: block.slot(),
                end_offset: self.end_offset(),
            },
        );
    }

    /// Appends a batch that arrived compressed, keeping the artifact for
    /// reuse when it covers the whole chunk by itself.
    pub fn add_compressed_batch(&mut self, compressed: &[u8], blocks: &[ParsedBlock]) {
        let Some(first) = blocks.first() else {
            return;
        };
        let id = chunk_id(first.slot(), self.epoch_length);
        if blocks
            .iter()
            .any(|b| chunk_id(b.slot(), self.epoch_length) != id)
        {
            // a batch straddling chunks cannot be reused as one artifact
            for block in blocks {
                self.add_block(block);
            }
            return;
        }

        self.roll_over(id);
        let fresh = self.open.is_empty();
        for block in blocks {
            self.open.extend_from_slice(block.bytes());
        }
        self.open_last_slot = blocks.last().map(|b| b.slot());
        self.precompressed = fresh.then(|| compressed.to_vec());
        if let Some(last) = blocks.last() {
            self.progress.report(
                "download",
                Progress {
                    slot: last.slot(),
                    end_offset: self.end_offset(),
                },
            );
        }
    }

    /// Flushes the open chunk to the registry through the blocking pool.
    pub fn flush(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.open);
        let precompressed = self.precompressed.take();
        let last_slot = self.open_last_slot.take().unwrap_or(0);
        let offset = self.next_offset;
        self.next_offset += raw.len() as u64;
        self.open_chunk_id = None;

        if !self.watermark.allows(offset, raw.len() as u64) {
            debug!(offset, "skipping a chunk above the invalidation watermark");
            return;
        }

        let registry = self.registry.clone();
        let watermark = self.watermark.clone();
        let progress = self.progress.clone();
        self.tasks.spawn_blocking(move || {
            // the watermark may have moved while this task sat in the queue
            if !watermark.allows(offset, raw.len() as u64) {
                debug!(offset, "cancelled a queued chunk commit");
                return Ok(());
            }
            let compressed = match precompressed {
                Some(artifact) => artifact,
                None => compress_chunk(&raw).map_err(ChunkError::from)?,
            };
            registry.add_compressed(offset, &compressed, &raw)?;
            progress.report(
                "parse",
                Progress {
                    slot: last_slot,
                    end_offset: offset + raw.len() as u64,
                },
            );
            Ok(())
        });
    }

    /// Waits for every queued commit, surfacing the first failure.
    pub async fn drain(&mut self) -> Result<(), SyncError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => {
                    return Err(SyncError::Internal(format!("a chunk task panicked: {e}")))
                }
            }
        }
        Ok(())
    }
}

/// Drives sync attempts against one peer at a time.
pub struct Syncer {
    registry: Arc<dyn ChunkRegistry>,
    params: NetworkParameters,
    watermark: Arc<Watermark>,
    progress: Arc<dyn ProgressSink>,
}

impl Syncer {
    /// Builds a syncer appending to `registry`.
    pub fn new(registry: Arc<dyn ChunkRegistry>, params: NetworkParameters) -> Self {
        Syncer {
            registry,
            params,
            watermark: Arc::new(Watermark::new()),
            progress: Arc::new(TracingProgress),
        }
    }

    /// Replaces the progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Finds the deepest block shared with the peer behind `client`.
    pub async fn find_peer(&self, client: Box<dyn ChainClient>) -> Result<PeerInfo, SyncError> {
        crate::peer_info::find_peer(self.registry.as_ref(), client).await
    }

    /// Records a validation failure: queued work at or above
    /// `max_valid_offset` is cancelled until the next sync attempt.
    pub fn cancel_tasks(&self, max_valid_offset: u64) {
        self.watermark.cancel(max_valid_offset);
    }

    /// The shared watermark, for validators running elsewhere.
    pub fn watermark(&self) -> Arc<Watermark> {
        self.watermark.clone()
    }

    /// One sync attempt: stream blocks from the peer's intersection towards
    /// its tip, stopping at `max_slot` when given.
    pub async fn sync(&self, peer: &mut PeerInfo, max_slot: Option<u64>) -> Result<(), SyncError> {
        // a fresh attempt clears the previous failure watermark
        self.watermark.reset();

        let start_offset = match peer.intersection() {
            Some(point) => {
                let pos = self.registry.find_block(&point).ok_or_else(|| {
                    SyncError::Internal("the intersection block is not local".to_string())
                })?;
                self.registry
                    .block_info(pos)
                    .map(|info| info.end_offset())
                    .ok_or_else(|| {
                        SyncError::Internal("the intersection block is not local".to_string())
                    })?
            }
            None => 0,
        };

        let continue_from: Vec<Point2> = peer.intersection().into_iter().collect();
        let fetch = peer
            .client_mut()
            .fetch_headers(continue_from, 1, true)
            .await?;
        let Some(first) = fetch.headers.first().copied() else {
            // nothing past the intersection, we are already in sync
            return Ok(());
        };
        if let Some(max) = max_slot {
            if first.slot > max {
                return Ok(());
            }
        }
        let target = fetch.tip;

        let writer = Arc::new(Mutex::new(ChunkWriter::new(
            self.registry.clone(),
            self.params.epoch_length,
            start_offset,
            self.watermark.clone(),
            self.progress.clone(),
        )));
        let sink_writer = writer.clone();
        let watermark = self.watermark.clone();
        let error_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sink_errors = error_slot.clone();

        let sink: BlockSink = Box::new(move |resp| {
            if watermark.get().is_some() {
                return false;
            }

            let (blocks, reuse) = match &resp {
                BlockResponse::Block(bytes) => match ParsedBlock::decode(bytes) {
                    Ok(block) => (vec![block], None),
                    Err(e) => {
                        *sink_errors.lock().expect("error slot poisoned") = Some(e.to_string());
                        return false;
                    }
                },
                BlockResponse::CompressedBlocks { encoding, payload } => {
                    let reuse = (*encoding == ENCODING_ZSTD).then(|| payload.clone());
                    let raw = match resp.clone().into_bytes() {
                        Ok(raw) => raw,
                        Err(e) => {
                            *sink_errors.lock().expect("error slot poisoned") =
                                Some(e.to_string());
                            return false;
                        }
                    };
                    match ParsedBlock::decode_all(&raw) {
                        Ok(blocks) => (blocks, reuse),
                        Err(e) => {
                            *sink_errors.lock().expect("error slot poisoned") =
                                Some(e.to_string());
                            return false;
                        }
                    }
                }
            };

            let within = |block: &ParsedBlock| max_slot.map_or(true, |m| block.slot() <= m);
            let mut writer = sink_writer.lock().expect("writer state poisoned");
            if let Some(artifact) = reuse {
                if blocks.iter().all(within) {
                    writer.add_compressed_batch(&artifact, &blocks);
                    return true;
                }
            }
            for block in &blocks {
                if !within(block) {
                    return false;
                }
                writer.add_block(block);
            }
            true
        });

        peer.client_mut()
            .fetch_blocks(first, target.point2(), sink)
            .await?;

        if let Some(msg) = error_slot.lock().expect("error slot poisoned").take() {
            return Err(SyncError::Stream(msg));
        }

        let writer = Arc::try_unwrap(writer)
            .map_err(|_| SyncError::Internal("the block stream is still running".to_string()))?;
        let mut writer = writer
            .into_inner()
            .map_err(|_| SyncError::Internal("writer state poisoned".to_string()))?;
        writer.flush();
        writer.drain().await
    }
}
