//! Gas schedule and the gas-metered execution environment.
//!
//! Every cost is deducted before the work it pays for, so an out-of-gas
//! failure never leaves observable effects beyond the consumed gas.

use crate::virtual_machine::errors::VmError;

/// Flat cost of executing one instruction.
pub const GAS_INSTRUCTION_BASE: u64 = 4;

/// Additional cost of one load/store memory access.
pub const GAS_MEMORY_OP: u64 = 12;

/// Cost of allocating one 4096-byte page on first touch.
pub const GAS_MEMORY_PAGE: u64 = 1000;

/// Flat cost of entering a call frame (external, cross-program or start-up).
pub const GAS_CALL: u64 = 2800;

/// Up-front cost of a type-2 transaction before its raw code runs.
pub const GAS_VM_TX_RAW_CODE: u64 = 5000;

/// Per-64-byte-block surcharge of the SHA256 syscall.
pub const GAS_SYSCALL_SHA256_PER_BLOCK: u64 = 60;

/// Per-128-byte-block surcharge of the ED25519_VERIFY syscall.
pub const GAS_SYSCALL_ED25519_PER_BLOCK: u64 = 100;

/// Per-byte surcharge of the REVERT message.
pub const GAS_SYSCALL_REVERT_PER_BYTE: u64 = 1;

/// Per-byte surcharge of the TRANSFER message.
pub const GAS_SYSCALL_TRANSFER_MESSAGE_PER_BYTE: u64 = 1;

/// Per-byte surcharge of the CREATE image read.
pub const GAS_SYSCALL_CREATE_PER_BYTE: u64 = 1;

/// Per-32-byte-block surcharge of storing created contract code.
pub const GAS_SYSCALL_CREATE_STORE_PER_BLOCK: u64 = 10_000;

/// Cost of LOAD_CONTRACT when the ELF is already in the per-invocation cache.
pub const GAS_LOAD_CONTRACT_CODE_CACHED: u64 = 400;

/// Base cost of fetching contract code from the slice.
pub const GAS_LOAD_CONTRACT_CODE: u64 = 20_000;

/// Per-32-byte-block cost of fetching contract code from the slice.
pub const GAS_LOAD_CONTRACT_CODE_PER_BLOCK: u64 = 2_000;

/// Gas-metered execution environment threaded through one call frame.
#[derive(Debug, Clone, Copy)]
pub struct ExecEnv {
    pub gas: u64,
}

impl ExecEnv {
    pub fn new(gas: u64) -> Self {
        Self { gas }
    }

    /// Deducts `amount`, failing with `InsufficientGas` when the counter
    /// cannot cover it. Call before performing the paid-for work.
    #[inline]
    pub fn charge(&mut self, amount: u64) -> Result<(), VmError> {
        if self.gas < amount {
            return Err(VmError::InsufficientGas);
        }
        self.gas -= amount;
        Ok(())
    }
}
