//! Peer search and sync tests against a scripted peer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use grevy_chain::{
    chunk_id, registry::compress_chunk, BlockHash, ChunkArchive, ChunkRegistry, Header,
    IntersectionInfo, NetworkParameters, ParsedBlock, Point2, Point3,
};
use grevy_network::{
    protocol::block_fetch::ENCODING_ZSTD, BlockResponse, BlockSink, ChainClient, ClientError,
    HeaderFetch,
};
use grevy_sync::{find_peer, SyncError, Syncer, POINTS_PER_QUERY};

fn hash(i: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&i.to_be_bytes());
    BlockHash(bytes)
}

fn params() -> NetworkParameters {
    NetworkParameters {
        genesis_hash: hash(0),
        ..NetworkParameters::default()
    }
}

/// Builds a linked chain with `blocks_per_chunk` blocks in each of
/// `num_chunks` epoch-chunks. Hash ids start at 1000 so they never collide
/// with the genesis hash.
fn build_chain(num_chunks: usize, blocks_per_chunk: usize) -> Vec<ParsedBlock> {
    let epoch_length = params().epoch_length;
    let mut blocks = Vec::new();
    let mut prev = hash(0);
    let mut height = 0u64;
    for chunk in 0..num_chunks {
        for i in 0..blocks_per_chunk {
            height += 1;
            let slot = chunk as u64 * epoch_length + i as u64;
            let this = hash(1000 + height);
            blocks.push(ParsedBlock::new(
                Header {
                    era: 1,
                    slot,
                    hash: this,
                    prev_hash: prev,
                    height,
                },
                vec![0x7A; 20],
            ));
            prev = this;
        }
    }
    blocks
}

/// A chain that shares `shared` blocks with `base` and then diverges.
fn diverging_chain(base: &[ParsedBlock], shared: usize, extra: usize) -> Vec<ParsedBlock> {
    let mut blocks: Vec<ParsedBlock> = base[..shared].to_vec();
    let mut prev = blocks.last().map(|b| b.hash()).unwrap_or(hash(0));
    let mut height = blocks.last().map(|b| b.height()).unwrap_or(0);
    let mut slot = blocks.last().map(|b| b.slot()).unwrap_or(0);
    for i in 0..extra {
        height += 1;
        slot += 1;
        let this = hash(500_000 + i as u64);
        blocks.push(ParsedBlock::new(
            Header {
                era: 1,
                slot,
                hash: this,
                prev_hash: prev,
                height,
            },
            vec![0x5C; 20],
        ));
        prev = this;
    }
    blocks
}

fn archive_with(blocks: &[ParsedBlock]) -> Arc<ChunkArchive> {
    let params = params();
    let archive = ChunkArchive::ephemeral(params);
    let mut offset = 0u64;
    let mut i = 0;
    while i < blocks.len() {
        let id = chunk_id(blocks[i].slot(), params.epoch_length);
        let mut raw = Vec::new();
        let mut j = i;
        while j < blocks.len() && chunk_id(blocks[j].slot(), params.epoch_length) == id {
            raw.extend_from_slice(blocks[j].bytes());
            j += 1;
        }
        let compressed = compress_chunk(&raw).expect("compresses");
        archive
            .add_compressed(offset, &compressed, &raw)
            .expect("chunk appends");
        offset += raw.len() as u64;
        i = j;
    }
    Arc::new(archive)
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mode {
    Plain,
    Compressed,
    CorruptBlocks,
}

/// A scripted peer holding its own copy of a chain.
struct MockPeer {
    chain: Vec<ParsedBlock>,
    mode: Mode,
    queries: Arc<Mutex<Vec<Vec<Point2>>>>,
}

impl MockPeer {
    fn new(chain: Vec<ParsedBlock>, mode: Mode) -> (Box<Self>, Arc<Mutex<Vec<Vec<Point2>>>>) {
        let queries = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(MockPeer {
                chain,
                mode,
                queries: queries.clone(),
            }),
            queries,
        )
    }

    fn tip(&self) -> Point3 {
        self.chain.last().map(|b| b.point3()).unwrap_or(Point3 {
            slot: 0,
            hash: hash(0),
            height: 0,
        })
    }

    fn position(&self, point: &Point2) -> Option<usize> {
        self.chain
            .iter()
            .position(|b| b.slot() == point.slot && b.hash() == point.hash)
    }
}

#[async_trait]
impl ChainClient for MockPeer {
    async fn find_tip(&mut self) -> Result<IntersectionInfo, ClientError> {
        Ok(IntersectionInfo {
            isect: None,
            tip: self.tip(),
        })
    }

    async fn find_intersection(
        &mut self,
        points: Vec<Point2>,
    ) -> Result<IntersectionInfo, ClientError> {
        self.queries
            .lock()
            .expect("queries lock poisoned")
            .push(points.clone());
        for point in &points {
            if self.position(point).is_some() {
                return Ok(IntersectionInfo {
                    isect: Some(*point),
                    tip: self.tip(),
                });
            }
        }
        Ok(IntersectionInfo {
            isect: None,
            tip: self.tip(),
        })
    }

    async fn fetch_headers(
        &mut self,
        points: Vec<Point2>,
        max: usize,
        allow_empty: bool,
    ) -> Result<HeaderFetch, ClientError> {
        let isect = points
            .iter()
            .find_map(|p| self.position(p).map(|pos| (*p, pos)));
        let start = isect.map(|(_, pos)| pos + 1).unwrap_or(0);
        let headers: Vec<Point2> = self
            .chain
            .iter()
            .skip(start)
            .take(max)
            .map(|b| b.point2())
            .collect();
        if headers.is_empty() && !allow_empty && max > 0 {
            return Err(ClientError::EmptyHeaders);
        }
        Ok(HeaderFetch {
            intersect: isect.map(|(p, _)| p),
            tip: self.tip(),
            headers,
        })
    }

    async fn fetch_blocks(
        &mut self,
        from: Point2,
        to: Point2,
        mut sink: BlockSink,
    ) -> Result<(), ClientError> {
        let Some(start) = self.position(&from) else {
            return Err(ClientError::NoBlocks);
        };
        let Some(end) = self.position(&to) else {
            return Err(ClientError::NoBlocks);
        };

        match self.mode {
            Mode::Plain => {
                for block in &self.chain[start..=end] {
                    if !sink(BlockResponse::Block(block.bytes().to_vec())) {
                        return Ok(());
                    }
                }
            }
            Mode::CorruptBlocks => {
                if !sink(BlockResponse::Block(vec![0xFF, 0xFF])) {
                    return Ok(());
                }
            }
            Mode::Compressed => {
                let epoch_length = params().epoch_length;
                let mut i = start;
                while i <= end {
                    let id = chunk_id(self.chain[i].slot(), epoch_length);
                    let mut raw = Vec::new();
                    let mut j = i;
                    while j <= end && chunk_id(self.chain[j].slot(), epoch_length) == id {
                        raw.extend_from_slice(self.chain[j].bytes());
                        j += 1;
                    }
                    let payload = compress_chunk(&raw)?;
                    if !sink(BlockResponse::CompressedBlocks {
                        encoding: ENCODING_ZSTD,
                        payload,
                    }) {
                        return Ok(());
                    }
                    i = j;
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {}
}

#[tokio::test]
async fn find_peer_on_an_empty_local_chain_reports_the_tip() {
    grevy_test::init();

    let remote = build_chain(2, 3);
    let local = archive_with(&[]);
    let (peer, _queries) = MockPeer::new(remote.clone(), Mode::Plain);

    let info = find_peer(local.as_ref(), peer).await.expect("search runs");
    assert_eq!(info.intersection(), None);
    assert_eq!(info.tip(), remote.last().expect("chain is not empty").point3());
}

#[tokio::test]
async fn find_peer_narrows_to_the_newest_shared_block() {
    grevy_test::init();

    let full = build_chain(60, 3);
    let local = archive_with(&full);
    // the peer shares the first 100 blocks and then follows its own fork
    let shared = 100;
    let remote = diverging_chain(&full, shared, 40);
    let (peer, queries) = MockPeer::new(remote, Mode::Plain);

    let info = find_peer(local.as_ref(), peer).await.expect("search runs");
    assert_eq!(
        info.intersection(),
        Some(full[shared - 1].point2()),
        "the newest shared block wins"
    );

    let queries = queries.lock().expect("queries lock poisoned");
    assert!(!queries.is_empty());
    for probe in queries.iter() {
        assert!(
            probe.len() <= POINTS_PER_QUERY,
            "a probe exceeded the per-round cap: {}",
            probe.len()
        );
        // probes go out newest first
        for pair in probe.windows(2) {
            assert!(pair[0].slot >= pair[1].slot);
        }
    }
}

#[tokio::test]
async fn find_peer_with_no_shared_history() {
    grevy_test::init();

    let local = archive_with(&build_chain(4, 3));
    // a chain built from a different genesis shares nothing
    let mut remote = build_chain(2, 3);
    for block in &mut remote {
        *block = ParsedBlock::new(
            Header {
                era: 1,
                slot: block.slot(),
                hash: hash(900_000 + block.height()),
                prev_hash: hash(900_000 + block.height() - 1),
                height: block.height(),
            },
            block.body().to_vec(),
        );
    }
    let (peer, _queries) = MockPeer::new(remote, Mode::Plain);

    let info = find_peer(local.as_ref(), peer).await.expect("search runs");
    assert_eq!(info.intersection(), None);
}

#[tokio::test]
async fn sync_downloads_a_whole_chain() {
    grevy_test::init();

    let remote = build_chain(2, 3);
    let local = archive_with(&[]);
    let syncer = Syncer::new(local.clone(), params());
    let (peer, _queries) = MockPeer::new(remote.clone(), Mode::Plain);

    let mut peer = syncer.find_peer(peer).await.expect("search runs");
    syncer.sync(&mut peer, None).await.expect("sync succeeds");

    assert_eq!(local.num_blocks(), remote.len());
    assert_eq!(local.num_chunks(), 2);
    assert_eq!(
        local.tip().expect("chain is not empty"),
        remote.last().expect("chain is not empty").point3()
    );
}

#[tokio::test]
async fn sync_resumes_past_the_intersection() {
    grevy_test::init();

    let remote = build_chain(2, 3);
    // the local chain already holds the first chunk
    let local = archive_with(&remote[..3]);
    let syncer = Syncer::new(local.clone(), params());
    let (peer, _queries) = MockPeer::new(remote.clone(), Mode::Plain);

    let mut peer = syncer.find_peer(peer).await.expect("search runs");
    assert_eq!(peer.intersection(), Some(remote[2].point2()));
    syncer.sync(&mut peer, None).await.expect("sync succeeds");

    assert_eq!(local.num_blocks(), remote.len());
    assert_eq!(
        local.tip().expect("chain is not empty"),
        remote.last().expect("chain is not empty").point3()
    );
}

#[tokio::test]
async fn sync_stops_at_the_slot_cap() {
    grevy_test::init();

    let remote = build_chain(2, 3);
    let local = archive_with(&[]);
    let syncer = Syncer::new(local.clone(), params());
    let (peer, _queries) = MockPeer::new(remote.clone(), Mode::Plain);

    let mut peer = syncer.find_peer(peer).await.expect("search runs");
    let cap = remote[2].slot();
    syncer
        .sync(&mut peer, Some(cap))
        .await
        .expect("sync succeeds");

    assert_eq!(local.num_blocks(), 3, "nothing past the cap is stored");
    assert_eq!(local.tip().expect("chain is not empty").slot, cap);
}

#[tokio::test]
async fn sync_accepts_compressed_batches() {
    grevy_test::init();

    let remote = build_chain(2, 3);
    let local = archive_with(&[]);
    let syncer = Syncer::new(local.clone(), params());
    let (peer, _queries) = MockPeer::new(remote.clone(), Mode::Compressed);

    let mut peer = syncer.find_peer(peer).await.expect("search runs");
    syncer.sync(&mut peer, None).await.expect("sync succeeds");

    assert_eq!(local.num_blocks(), remote.len());
    assert_eq!(local.num_chunks(), 2);
    assert_eq!(
        local.tip().expect("chain is not empty"),
        remote.last().expect("chain is not empty").point3()
    );
}

#[tokio::test]
async fn a_corrupt_block_stream_surfaces_as_an_error() {
    grevy_test::init();

    let remote = build_chain(1, 3);
    let local = archive_with(&[]);
    let syncer = Syncer::new(local.clone(), params());
    let (peer, _queries) = MockPeer::new(remote, Mode::CorruptBlocks);

    let mut peer = syncer.find_peer(peer).await.expect("search runs");
    let result = syncer.sync(&mut peer, None).await;
    assert!(matches!(result, Err(SyncError::Stream(_))));
    assert_eq!(local.num_blocks(), 0);
}
