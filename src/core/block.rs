//! Blocks: header commitments, wire codec and ordered execution.
//!
//! `body_hash` commits to the serialized body (miner, time, transactions);
//! `hash` commits to `parent_hash || body_hash || extra_data`. Decoding
//! re-verifies both commitments, so a decoded block is always internally
//! consistent.

use crate::core::account::{get_account_info, set_account_info};
use crate::core::context::ExecutionContext;
use crate::core::transaction::{execute_tx, Transaction};
use crate::core::BlockError;
use crate::storage::slice::Slice;
use crate::types::address::Address;
use crate::types::encoding::{
    read_bytes, read_uvarint, write_uvarint, Decode, DecodeError, Encode, EncodeSink, SizeCounter,
};
use crate::types::hash::{Hash, HASH_LEN};
use std::sync::Arc;

/// Hard cap on transactions per block.
pub const MAX_BLOCK_TXS: u64 = 1 << 20;

/// Four 32-byte words; the wire form is their plain concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub body_hash: Hash,
    pub extra_data: Hash,
}

impl BlockHeader {
    /// Recomputes the header commitment over parent, body and extra words.
    pub fn compute_hash(&self) -> Hash {
        let mut h = Hash::sha256();
        h.update(self.parent_hash.as_slice());
        h.update(self.body_hash.as_slice());
        h.update(self.extra_data.as_slice());
        h.finalize()
    }

    /// Decodes a header, rejecting one whose hash word lies.
    pub fn decode(input: &mut &[u8]) -> Result<Self, BlockError> {
        let bytes = read_bytes(input, HASH_LEN * 4)?;
        let header = BlockHeader {
            hash: Hash::from_slice(&bytes[..HASH_LEN]).unwrap(),
            parent_hash: Hash::from_slice(&bytes[HASH_LEN..HASH_LEN * 2]).unwrap(),
            body_hash: Hash::from_slice(&bytes[HASH_LEN * 2..HASH_LEN * 3]).unwrap(),
            extra_data: Hash::from_slice(&bytes[HASH_LEN * 3..]).unwrap(),
        };
        if header.compute_hash() != header.hash {
            return Err(BlockError::HeaderHashMismatch);
        }
        Ok(header)
    }
}

impl Encode for BlockHeader {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(self.hash.as_slice());
        out.write(self.parent_hash.as_slice());
        out.write(self.body_hash.as_slice());
        out.write(self.extra_data.as_slice());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub miner: Address,
    /// Unix timestamp in nanoseconds.
    pub time: u64,
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Serializes the body (everything behind the header).
    pub fn encode_body<S: EncodeSink>(&self, out: &mut S) {
        out.write(self.miner.as_slice());
        out.write(&self.time.to_le_bytes());
        write_uvarint(out, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(out);
        }
    }

    /// SHA-256 of the serialized body.
    pub fn compute_body_hash(&self) -> Hash {
        let mut h = Hash::sha256();
        self.encode_body(&mut h);
        h.finalize()
    }

    /// Fills `body_hash` and `hash` from the current contents.
    pub fn fill_hash(&mut self) {
        self.header.body_hash = self.compute_body_hash();
        self.header.hash = self.header.compute_hash();
    }

    /// Decodes a block and verifies both hash commitments.
    pub fn decode(input: &mut &[u8]) -> Result<Self, BlockError> {
        let header = BlockHeader::decode(input)?;
        let miner_bytes = read_bytes(input, 32)?;
        let miner = Address::from_slice(miner_bytes).unwrap();
        let time = u64::from_le_bytes(read_bytes(input, 8)?.try_into().unwrap());
        let tx_count = read_uvarint(input)?;
        if tx_count > MAX_BLOCK_TXS {
            return Err(DecodeError::LengthOverflow.into());
        }
        let mut txs = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            txs.push(Transaction::decode(input)?);
        }
        let block = Block {
            header,
            miner,
            time,
            txs,
        };
        if block.compute_body_hash() != block.header.body_hash {
            return Err(BlockError::BodyHashMismatch);
        }
        Ok(block)
    }

    /// Decodes a block from a complete buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self, BlockError> {
        let mut input = data;
        let block = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::InvalidValue.into());
        }
        Ok(block)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);
        let mut out = Vec::with_capacity(counter.len());
        self.encode(&mut out);
        out
    }
}

impl Encode for Block {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.header.encode(out);
        self.encode_body(out);
    }
}

/// Applies a block's transactions in order, then credits the miner with the
/// accumulated fees plus the block reward.
pub fn execute_block(
    block: &Block,
    reward: u64,
    slice: &Arc<Slice>,
    ctx: &ExecutionContext,
) -> Result<(), BlockError> {
    let mut total_fee: u64 = 0;
    for tx in &block.txs {
        execute_tx(tx, slice, ctx)?;
        // Bounded by the money supply, so this cannot overflow
        total_fee += tx.fee;
    }
    let mut miner = get_account_info(slice, &block.miner);
    miner.balance += total_fee + reward;
    set_account_info(slice, &block.miner, miner)?;
    ctx.notify_transfer(
        slice,
        Address::zero(),
        block.miner,
        total_fee + reward,
        &[],
        None,
    );
    Ok(())
}
