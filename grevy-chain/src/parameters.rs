//! Network parameters injected into the protocol engine.

use crate::block::BlockHash;

/// Chain-level constants the engine is parameterized over.
///
/// These come from the network's genesis configuration; the engine never
/// derives them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NetworkParameters {
    /// The network magic exchanged during version negotiation.
    pub magic: u32,
    /// The hash of the genesis configuration, used as the tip of an empty
    /// chain and as the previous-hash of the first chunk.
    pub genesis_hash: BlockHash,
    /// Slots per epoch-chunk; a block's chunk id is `slot / epoch_length`.
    pub epoch_length: u64,
    /// Slots per KES period, consumed by the block-producer helper.
    pub kes_period_slots: u64,
}

/// Parameters of the production network.
pub const MAINNET: NetworkParameters = NetworkParameters {
    magic: 764_824_073,
    genesis_hash: BlockHash([
        0x89, 0xd9, 0xb5, 0xa5, 0xb8, 0xdd, 0xc8, 0xd7, 0xe5, 0xa6, 0x79, 0x5e, 0x97, 0x74, 0xd9,
        0x7f, 0xaf, 0x1e, 0xfe, 0xa5, 0x9b, 0x2c, 0xaf, 0x7e, 0xaf, 0x9f, 0x8c, 0x5b, 0x32, 0x05,
        0x9d, 0xf4,
    ]),
    epoch_length: 21_600,
    kes_period_slots: 129_600,
};

impl Default for NetworkParameters {
    fn default() -> Self {
        MAINNET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_genesis_hash_matches_hex() {
        grevy_test::init();

        let expected = BlockHash::from_hex(
            "89d9b5a5b8ddc8d7e5a6795e9774d97faf1efea59b2caf7eaf9f8c5b32059df4",
        )
        .expect("valid hash");
        assert_eq!(MAINNET.genesis_hash, expected);
    }
}
