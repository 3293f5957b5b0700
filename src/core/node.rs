//! The chain node: block resolution, candidate assembly and state queries.
//!
//! This is the boundary the RPC and mining glue call into. Network gossip
//! and synchronization live outside; they feed blocks and transactions in
//! through [`ChainNode::submit_block`] / [`ChainNode::submit_tx`] and read
//! back through the getters. The node is the sole writer to the slice tree;
//! every observation or mutation of the tree happens under one mutex.

use crate::core::block::{execute_block, Block, BlockHeader};
use crate::core::config::{GlobalConfig, NodeConfig};
use crate::core::consensus::ConsensusState;
use crate::core::context::{ExecutionCallback, ExecutionContext};
use crate::core::transaction::{execute_tx, Transaction, TX_TRANSFER, TX_VM_CALL};
use crate::core::BlockError;
use crate::storage::engine::{SliceKey, StorageEngine, StorageEngineConfig};
use crate::storage::slice::Slice;
use crate::types::address::Address;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::warn;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How far above the finalization horizon the resolver follows parent links.
const RESOLVE_DEPTH_SLACK: u64 = 3;

/// Tolerated clock skew for incoming block timestamps.
const MAX_FUTURE_DRIFT: Duration = Duration::from_secs(60);

pub struct ChainNode {
    engine: Mutex<StorageEngine>,
    unresolved: DashMap<Hash, BlockHeader>,
    block_cache: DashMap<Hash, Arc<Block>>,
    consensus_cache: DashMap<Hash, ConsensusState>,
    tx_pool: DashMap<Hash, Transaction>,
    config: NodeConfig,
    global: GlobalConfig,
    callback: Option<Arc<ExecutionCallback>>,
}

fn slice_key(hash: &Hash) -> SliceKey {
    hash.0
}

fn encode_blob(cs: &ConsensusState, block: &Block) -> Vec<u8> {
    let mut blob = cs.to_bytes();
    block.encode(&mut blob);
    blob
}

impl ChainNode {
    /// Boots a node: verifies and executes the genesis block on an empty
    /// slice, threads the genesis consensus state, and opens (or recovers)
    /// the storage engine underneath.
    pub fn new(
        config: NodeConfig,
        global: GlobalConfig,
        callback: Option<Arc<ExecutionCallback>>,
    ) -> Result<ChainNode, BlockError> {
        let genesis = &global.genesis_block;
        if genesis.header.compute_hash() != genesis.header.hash {
            return Err(BlockError::HeaderHashMismatch);
        }
        if genesis.compute_body_hash() != genesis.header.body_hash {
            return Err(BlockError::BodyHashMismatch);
        }

        let slice = Slice::empty();
        let genesis_ctx = build_context(
            &global,
            &callback,
            &global.genesis_consensus_state,
            genesis,
        );
        execute_block(genesis, global.genesis_block_reward, &slice, &genesis_ctx)?;

        let mut cs = global.genesis_consensus_state;
        if !cs.check_and_update(genesis) {
            return Err(BlockError::ConsensusRejected);
        }

        let blob = encode_blob(&cs, genesis);
        let engine = StorageEngine::open(
            StorageEngineConfig {
                finalize_depth: config.storage_finalize_depth,
                dump_disk_ratio: config.storage_dump_disk_ratio,
                path: config.storage_path.clone().into(),
            },
            slice,
            slice_key(&genesis.header.hash),
            blob,
        )?;

        let node = ChainNode {
            engine: Mutex::new(engine),
            unresolved: DashMap::new(),
            block_cache: DashMap::new(),
            consensus_cache: DashMap::new(),
            tx_pool: DashMap::new(),
            config,
            global,
            callback,
        };
        node.block_cache.insert(
            node.global.genesis_block.header.hash,
            Arc::new(node.global.genesis_block.clone()),
        );
        node.consensus_cache
            .insert(node.global.genesis_block.header.hash, cs);
        Ok(node)
    }

    /// Builds an unsigned candidate on top of the highest slice.
    ///
    /// Pool transactions are tried in `(fee desc, hash asc)` order, each on
    /// its own sub-fork; only the ones that apply cleanly are included.
    pub fn get_block_candidate(&self, miner: Address) -> Result<Block, BlockError> {
        let engine = self.engine.lock().unwrap();
        let chain = engine.highest_chain();
        let (tip_key, tip_slice) = chain.last().expect("chain always has a root").clone();
        let tip_hash = Hash(tip_key);
        drop(engine);
        let tip_cs = self
            .consensus_state_at(tip_slice.height() as i64, tip_hash)
            .ok_or(BlockError::ConsensusRejected)?;

        let mut block = Block {
            miner,
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            ..Default::default()
        };
        block.header.parent_hash = tip_hash;

        let ctx = build_context(&self.global, &self.callback, &tip_cs, &block);
        let staging = Slice::fork(&tip_slice);

        let mut pool: Vec<(u64, Hash, Transaction)> = self
            .tx_pool
            .iter()
            .map(|entry| (entry.value().fee, *entry.key(), entry.value().clone()))
            .collect();
        pool.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, tx) in pool {
            let attempt = Slice::fork(&staging);
            if execute_tx(&tx, &attempt, &ctx).is_ok() {
                attempt.merge();
                block.txs.push(tx);
            }
        }

        block.fill_hash();
        Ok(block)
    }

    /// Inserts a block into the unresolved set and runs the resolver.
    pub fn submit_block(&self, block: Block) -> Result<(), BlockError> {
        if block.header.compute_hash() != block.header.hash {
            return Err(BlockError::HeaderHashMismatch);
        }
        if block.compute_body_hash() != block.header.body_hash {
            return Err(BlockError::BodyHashMismatch);
        }
        let hash = block.header.hash;
        self.block_cache.insert(hash, Arc::new(block.clone()));
        self.unresolved.insert(hash, block.header);
        self.resolve_blocks();
        Ok(())
    }

    /// Surface-validates a transaction and puts it into the pool.
    pub fn submit_tx(&self, tx: Transaction) -> Result<(), BlockError> {
        if tx.tx_type != TX_TRANSFER && tx.tx_type != TX_VM_CALL {
            return Err(BlockError::TxWrongType);
        }
        if !tx.verify() {
            return Err(BlockError::TxSignatureMismatch);
        }
        self.tx_pool.insert(tx.hash(), tx);
        Ok(())
    }

    /// Drops a transaction from the pool (after inclusion or expiry).
    pub fn forget_tx(&self, hash: &Hash) {
        self.tx_pool.remove(hash);
    }

    /// The deepest block on the highest chain and its consensus state.
    pub fn get_highest(&self) -> Result<(Arc<Block>, ConsensusState), BlockError> {
        let engine = self.engine.lock().unwrap();
        let (tip_key, tip_slice) = engine.highest_slice();
        drop(engine);
        let height = tip_slice.height() as i64;
        let hash = Hash(tip_key);
        let block = self
            .block_at(height, hash)
            .ok_or(BlockError::Storage(crate::storage::StorageError::KeyMissing(
                height as u64,
            )))?;
        let cs = self
            .consensus_state_at(height, hash)
            .ok_or(BlockError::ConsensusRejected)?;
        Ok((block, cs))
    }

    /// The block at `height` on the highest chain (finalized or not).
    pub fn get_block(&self, height: i64) -> Result<Arc<Block>, BlockError> {
        let engine = self.engine.lock().unwrap();
        let chain = engine.highest_chain();
        let root_height = chain[0].1.height() as i64;
        let hash = if height >= root_height && ((height - root_height) as usize) < chain.len() {
            Hash(chain[(height - root_height) as usize].0)
        } else {
            Hash(engine.read_key(height)?)
        };
        drop(engine);
        self.block_at(height, hash)
            .ok_or(BlockError::Storage(crate::storage::StorageError::KeyMissing(
                height as u64,
            )))
    }

    /// Balance and nonce of `addr` as seen from the highest slice.
    pub fn get_account_info(&self, addr: &Address) -> crate::core::account::AccountInfo {
        let engine = self.engine.lock().unwrap();
        let (_, slice) = engine.highest_slice();
        drop(engine);
        crate::core::account::get_account_info(&slice, addr)
    }

    /// Reads `(block, consensus)` at a height/hash through the caches.
    fn load_block(&self, height: i64, hash: Hash) -> Option<(Arc<Block>, ConsensusState)> {
        let blob = {
            let engine = self.engine.lock().unwrap();
            engine.read_data(height, &slice_key(&hash)).ok()?
        };
        let mut input = blob.as_slice();
        let cs = ConsensusState::decode(&mut input).ok()?;
        let block = Block::decode(&mut input).ok()?;
        if hash != Hash::zero() && block.header.hash != hash {
            return None;
        }
        let block = Arc::new(block);
        self.block_cache.insert(block.header.hash, Arc::clone(&block));
        self.consensus_cache.insert(block.header.hash, cs);
        Some((block, cs))
    }

    fn block_at(&self, height: i64, hash: Hash) -> Option<Arc<Block>> {
        if let Some(block) = self.block_cache.get(&hash) {
            return Some(Arc::clone(block.value()));
        }
        self.load_block(height, hash).map(|(block, _)| block)
    }

    fn consensus_state_at(&self, height: i64, hash: Hash) -> Option<ConsensusState> {
        if let Some(cs) = self.consensus_cache.get(&hash) {
            return Some(*cs.value());
        }
        self.load_block(height, hash).map(|(_, cs)| cs)
    }

    /// Walks the unresolved set toward known slices, executing and attaching
    /// every block whose parent is resolved. Repeats until a pass makes no
    /// progress, so a whole buffered chain lands in one call.
    fn resolve_blocks(&self) {
        loop {
            let mut progress = false;
            let mut visited = HashSet::new();
            let pending: Vec<Hash> = self.unresolved.iter().map(|e| *e.key()).collect();
            for hash in pending {
                self.try_resolve(hash, 0, &mut visited, &mut progress);
            }
            if !progress {
                return;
            }
        }
    }

    fn try_resolve(
        &self,
        hash: Hash,
        depth: u64,
        visited: &mut HashSet<Hash>,
        progress: &mut bool,
    ) {
        if depth > self.config.storage_finalize_depth + RESOLVE_DEPTH_SLACK {
            return;
        }
        if !visited.insert(hash) {
            return;
        }
        {
            let engine = self.engine.lock().unwrap();
            if engine.get_slice(&slice_key(&hash)).is_some() {
                drop(engine);
                self.unresolved.remove(&hash);
                return;
            }
        }
        let Some(header) = self.unresolved.get(&hash).map(|e| *e.value()) else {
            return;
        };
        self.try_resolve(header.parent_hash, depth + 1, visited, progress);

        let Some(block) = self.block_cache.get(&hash).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        if Duration::from_nanos(block.time) > now + MAX_FUTURE_DRIFT {
            self.unresolved.remove(&hash);
            return;
        }

        // In-memory parents resolve through their blob regardless of the
        // height hint; a finalized-out parent simply fails the lookup.
        let Some(parent_cs) = self.consensus_state_at(0, header.parent_hash) else {
            return;
        };
        let mut cs = parent_cs;
        if !cs.check_and_update(&block) {
            warn!("consensus rejected block {}", hash);
            self.unresolved.remove(&hash);
            return;
        }

        let blob = encode_blob(&cs, &block);
        let ctx = build_context(&self.global, &self.callback, &parent_cs, &block);

        let engine = self.engine.lock().unwrap();
        let Some(parent_slice) = engine.get_slice(&slice_key(&header.parent_hash)) else {
            return;
        };
        let fork = Slice::fork(&parent_slice);
        match execute_block(&block, self.global.block_reward, &fork, &ctx) {
            Ok(()) => {
                fork.freeze();
                if engine
                    .add_frozen_slice(fork, slice_key(&hash), slice_key(&header.parent_hash), blob)
                    .is_ok()
                {
                    drop(engine);
                    self.consensus_cache.insert(hash, cs);
                    self.unresolved.remove(&hash);
                    for tx in &block.txs {
                        self.forget_tx(&tx.hash());
                    }
                    *progress = true;
                }
            }
            Err(err) => {
                drop(engine);
                warn!("block {} failed execution: {}", hash, err);
                self.unresolved.remove(&hash);
            }
        }
    }
}

fn build_context(
    global: &GlobalConfig,
    callback: &Option<Arc<ExecutionCallback>>,
    parent_cs: &ConsensusState,
    block: &Block,
) -> ExecutionContext {
    let height = parent_cs.height + 1;
    ExecutionContext {
        height,
        time: block.time,
        miner: block.miner,
        difficulty: parent_cs.difficulty,
        chain_id: global.chain_id,
        tip1_enabled: height >= global.tip1_enable_height,
        callback: callback.clone(),
    }
}
