//! Shared fixtures for mini-protocol tests: a tiny two-block archive and
//! generator helpers.

use std::sync::Arc;

use grevy_chain::{
    registry::compress_chunk, BlockHash, ChunkArchive, ChunkRegistry, FromCbor, Header,
    NetworkParameters, ParsedBlock, Point2,
};

use crate::multiplexer::DataGenerator;

/// The genesis hash used by the test chains.
pub fn genesis_hash() -> BlockHash {
    BlockHash([0x11; 32])
}

/// Parameters for the test chains.
pub fn test_params() -> NetworkParameters {
    NetworkParameters {
        genesis_hash: genesis_hash(),
        ..NetworkParameters::default()
    }
}

/// The first block of the two-block chain.
pub fn first_point() -> Point2 {
    Point2 {
        slot: 21598,
        hash: BlockHash::from_hex(
            "02517B67DAB9416B39E333869B80E8425FE92665FCB0B2B5EE2B4C41D33901AB",
        )
        .expect("valid hash"),
    }
}

/// The second block of the two-block chain.
pub fn second_point() -> Point2 {
    Point2 {
        slot: 21599,
        hash: BlockHash::from_hex(
            "3BD04916B6BC2AD849D519CFAE4FFE3B1A1660C098DBCD3E884073DD54BC8911",
        )
        .expect("valid hash"),
    }
}

/// The blocks of the two-block chain, in order.
pub fn two_blocks() -> Vec<ParsedBlock> {
    let first = first_point();
    let second = second_point();
    vec![
        ParsedBlock::new(
            Header {
                era: 1,
                slot: first.slot,
                hash: first.hash,
                prev_hash: genesis_hash(),
                height: 1,
            },
            b"first block body".to_vec(),
        ),
        ParsedBlock::new(
            Header {
                era: 1,
                slot: second.slot,
                hash: second.hash,
                prev_hash: first.hash,
                height: 2,
            },
            b"second block body".to_vec(),
        ),
    ]
}

/// An archive holding exactly the two-block chain in one chunk.
pub fn two_block_archive() -> Arc<ChunkArchive> {
    let archive = ChunkArchive::ephemeral(test_params());
    let raw: Vec<u8> = two_blocks()
        .iter()
        .flat_map(|b| b.bytes().to_vec())
        .collect();
    let compressed = compress_chunk(&raw).expect("compresses");
    archive
        .add_compressed(0, &compressed, &raw)
        .expect("chunk appends");
    Arc::new(archive)
}

/// An archive with no blocks at all.
pub fn empty_archive() -> Arc<ChunkArchive> {
    Arc::new(ChunkArchive::ephemeral(test_params()))
}

/// Drains a response generator, decoding one message per step.
pub fn collect_messages<M: FromCbor>(generator: DataGenerator) -> Vec<M> {
    generator
        .map(|buf| M::from_cbor_bytes(&buf).expect("generated messages decode"))
        .collect()
}
