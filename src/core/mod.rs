//! Chain semantics: accounts, transactions, blocks, consensus and the node.

pub mod account;
pub mod block;
pub mod config;
pub mod consensus;
pub mod context;
pub mod node;
pub mod transaction;

use crate::storage::StorageError;
use crate::types::encoding::DecodeError;
use crate::virtual_machine::errors::VmError;
use rvchain_derive::Error;

/// Validation and execution errors of blocks and transactions.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Header hash does not commit to parent/body/extra.
    #[error("block header hash mismatch")]
    HeaderHashMismatch,
    /// Body hash does not match the serialized body.
    #[error("block body hash mismatch")]
    BodyHashMismatch,
    /// Consensus view rejected the block (difficulty or timestamp).
    #[error("block consensus rejected")]
    ConsensusRejected,
    /// Transaction type unknown, or not yet enabled at this height.
    #[error("wrong tx type")]
    TxWrongType,
    /// Ed25519 signature does not cover the signing preimage.
    #[error("signature mismatch")]
    TxSignatureMismatch,
    /// Transaction nonce differs from the sender's account nonce.
    #[error("nonce mismatch")]
    TxNonceMismatch,
    /// Sender balance below `value + fee`.
    #[error("balance not enough")]
    TxBalanceInsufficient,
    /// `value + fee` overflows.
    #[error("integer overflow")]
    TxIntegerOverflow,
    #[error("{0}")]
    Vm(VmError),
    #[error("{0}")]
    Decode(DecodeError),
    #[error("{0}")]
    Storage(StorageError),
}

impl From<VmError> for BlockError {
    fn from(err: VmError) -> Self {
        BlockError::Vm(err)
    }
}

impl From<DecodeError> for BlockError {
    fn from(err: DecodeError) -> Self {
        BlockError::Decode(err)
    }
}

impl From<StorageError> for BlockError {
    fn from(err: StorageError) -> Self {
        BlockError::Storage(err)
    }
}
