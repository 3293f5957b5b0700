//! Node and chain configuration.

use crate::core::block::Block;
use crate::core::consensus::ConsensusState;

/// Per-node operational settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the `perm/` and `temp/` storage layout.
    pub storage_path: String,
    /// Depth from the deepest leaf at which blocks become immutable.
    pub storage_finalize_depth: u64,
    /// Fraction of wall-clock time the dump worker may spend on disk,
    /// in `(0, 1]`.
    pub storage_dump_disk_ratio: f64,
}

/// Chain-wide parameters every node must agree on.
#[derive(Clone)]
pub struct GlobalConfig {
    pub chain_id: u16,
    pub genesis_block: Block,
    pub genesis_consensus_state: ConsensusState,
    /// Reward credited when executing the genesis block.
    pub genesis_block_reward: u64,
    /// Reward credited for every later block.
    pub block_reward: u64,
    /// Height at which type-2 transactions and the transfer minimum-gas rule
    /// activate.
    pub tip1_enable_height: i64,
}
