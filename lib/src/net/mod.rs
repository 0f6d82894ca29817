pub mod message;
pub mod pool;

pub use message::Message;
pub use pool::{ConnectionPool, PeerId};

use bitcoin::BlockHash;

/// Network-specific protocol constants. `genesis_hash` is derived from
/// the same `bitcoin::blockdata::constants::genesis_block` header the chain
/// is actually constructed on (see `Context::bootstrap`), so the `Genesis`
/// short-circuit in `check_block` and the control loop's "first run"
/// detection always agree with the header the block-tree is rooted at —
/// deriving it any other way risks a `genesis_hash` that never matches the
/// real genesis block's hash.
#[derive(Debug, Clone, Copy)]
pub struct NetParams {
    pub magic: [u8; 4],
    pub genesis_hash: BlockHash,
    pub max_peers: u32,
    pub default_port: u16,
}

impl NetParams {
    pub fn for_network(network: bitcoin::Network) -> Self {
        let genesis_hash = bitcoin::blockdata::constants::genesis_block(network).block_hash();
        match network {
            bitcoin::Network::Bitcoin => NetParams {
                magic: [0xF9, 0xBE, 0xB4, 0xD9],
                genesis_hash,
                max_peers: 1000,
                default_port: 8333,
            },
            bitcoin::Network::Testnet => NetParams {
                magic: [0x0B, 0x11, 0x09, 0x07],
                genesis_hash,
                max_peers: 100,
                default_port: 18333,
            },
            other => {
                log::warn!(
                    "network {other:?} has no dedicated profile, falling back to testnet3 constants"
                );
                NetParams {
                    magic: [0x0B, 0x11, 0x09, 0x07],
                    genesis_hash,
                    max_peers: 100,
                    default_port: 18333,
                }
            }
        }
    }
}
