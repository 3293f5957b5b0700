use rvchain_derive::Error;

/// Errors raised by the VM, from the CPU step function up through the
/// syscall layer.
///
/// `Reverted` carries the contract-supplied message; its `Display` form is
/// what `PROTECTED_CALL` exposes to the calling contract, so nested reverts
/// stack their prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Instruction word does not decode to a supported RV64IM instruction.
    #[error("illegal instruction")]
    IllegalInstruction,
    /// Division by zero, or signed overflow (INT_MIN / -1) in DIV/REM.
    #[error("division error")]
    Division,
    /// Effective address not a multiple of the access width.
    #[error("unaligned memory access")]
    UnalignedMemoryAccess,
    /// PC not 4-byte aligned, or outside the loadable program range.
    #[error("illegal pc")]
    IllegalPc,
    /// Access outside the allocated address space or privilege violation.
    #[error("segmentation fault")]
    SegFault,
    /// Gas counter exhausted.
    #[error("insufficient gas")]
    InsufficientGas,
    /// Cross-program jump to a destination never marked via JUMPDEST.
    #[error("invalid jump dest")]
    InvalidJumpDest,
    /// Jump into the syscall program at an unknown or misaligned slot.
    #[error("invalid syscall")]
    InvalidSyscall,
    /// Syscall argument out of range (oversized buffer, foreign jumpdest,
    /// unknown program slot).
    #[error("illegal syscall parameters")]
    IllegalSyscallParameters,
    /// Transfer or protected call value exceeds the contract's balance.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// LOAD_CONTRACT target has no code in the current slice.
    #[error("contract not exist")]
    ContractNotExist,
    /// CREATE target address already holds code or a loaded program.
    #[error("contract exists")]
    ContractExists,
    /// Contract start-up returned an entry outside its own program.
    #[error("illegal entry")]
    IllegalEntry,
    /// Contract invoked REVERT with the given message.
    #[error("reverted: {0}")]
    Reverted(String),
    /// ELF image failed validation.
    #[error("invalid ELF: {0}")]
    ElfInvalid(&'static str),
    /// ELF segment spans more pages than a block can hold.
    #[error("invalid ELF: too many pages")]
    ElfTooManyPages,
    /// ELF segment privileges not representable in its target block.
    #[error("invalid ELF: segment privileges not allowed")]
    ElfSegmentBadPrivileges,
    /// Raw code image exceeds the 32-bit address space.
    #[error("code too long")]
    CodeTooLong,
}
