//! Consensus-derived execution context and the observer callback.

use crate::core::transaction::Transaction;
use crate::storage::slice::Slice;
use crate::types::address::Address;
use crate::types::hash::Hash;
use std::sync::Arc;

/// Observer for value movements, invoked on native transfers, VM transfers,
/// protected-call value attachments and miner rewards.
///
/// Callbacks must not mutate the slice except under key prefixes they own.
pub type TransferObserver = dyn Fn(&Arc<Slice>, Address, Address, u64, &[u8], Option<&Transaction>, &ExecutionContext)
    + Send
    + Sync;

/// Optional execution observers, used by explorers to index movements.
pub struct ExecutionCallback {
    pub transfer: Box<TransferObserver>,
}

/// Per-block environment visible to transaction execution and the syscall
/// surface, derived from the parent consensus state and the block header.
pub struct ExecutionContext {
    pub height: i64,
    pub time: u64,
    pub miner: Address,
    pub difficulty: Hash,
    pub chain_id: u16,
    /// Whether the tip1 upgrade rules apply at this height.
    pub tip1_enabled: bool,
    pub callback: Option<Arc<ExecutionCallback>>,
}

impl ExecutionContext {
    /// Notifies the observer of a value movement, if one is registered.
    pub fn notify_transfer(
        &self,
        slice: &Arc<Slice>,
        from: Address,
        to: Address,
        value: u64,
        message: &[u8],
        tx: Option<&Transaction>,
    ) {
        if let Some(cb) = &self.callback {
            (cb.transfer)(slice, from, to, value, message, tx, self);
        }
    }
}
