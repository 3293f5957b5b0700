//! VM invocation context: loaded programs, call frames and entry points.
//!
//! One `VmContext` lives for one top-level invocation. Cross-program jumps
//! are dispatch-table-free: the destination address itself encodes
//! `(program slot, entry)`, and the receiver's program memory is executed in
//! place. Every frame saves the callee's CPU state and restores it on exit,
//! so register corruption never escapes a revert.

use crate::core::context::ExecutionContext;
use crate::core::transaction::Transaction;
use crate::storage::slice::Slice;
use crate::types::address::Address;
use crate::virtual_machine::cpu::Cpu;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::exec::{exec, RET_ADDR, SYSCALL_PROG};
use crate::virtual_machine::gas::{ExecEnv, GAS_CALL, GAS_VM_TX_RAW_CODE};
use crate::virtual_machine::memory::{Memory, MAX_LOADED_PROGRAMS, MAX_PAGES_PER_BLOCK, PAGE_SIZE};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Initial stack pointer: 16 bytes below the top of block 3.
pub const DEFAULT_SP: u64 = 0x3000_0000 + (PAGE_SIZE * MAX_PAGES_PER_BLOCK) as u64 - 16;

/// PC where a type-2 transaction's raw code is installed.
pub const RAW_CODE_PC: u64 = 0x1000_0000;

/// How a call frame was entered; gates start-up-only syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Top-level transaction code.
    External,
    /// Contract `_start` run once when first loaded.
    Start,
    /// Ordinary cross-program call.
    Regular,
    /// Contract-creation initializer (enables LOAD_ELF).
    Init,
    /// Read-only query execution.
    View,
}

/// Parameters of one call frame.
pub struct CallParams {
    pub pc: u64,
    pub call_value: u64,
    pub args: Vec<u64>,
    pub caller: usize,
    pub kind: CallKind,
}

/// All state of one top-level VM invocation.
pub struct VmContext<'a> {
    pub(crate) ctx: &'a ExecutionContext,
    pub(crate) origin: Address,
    pub(crate) tx: Option<&'a Transaction>,
    pub(crate) mem: Memory,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) addrs: Vec<Address>,
    pub(crate) entries: Vec<u32>,
    pub(crate) load_id: HashMap<Address, usize>,
    pub(crate) elf_cache: HashMap<Address, Vec<u8>>,
    pub(crate) jump_dest: HashSet<u64>,
}

impl<'a> VmContext<'a> {
    pub fn new(ctx: &'a ExecutionContext, origin: Address, tx: Option<&'a Transaction>) -> Self {
        Self {
            ctx,
            origin,
            tx,
            mem: Memory::new(),
            cpus: Vec::new(),
            addrs: Vec::new(),
            entries: Vec::new(),
            load_id: HashMap::new(),
            elf_cache: HashMap::new(),
            jump_dest: HashSet::new(),
        }
    }

    /// Slot of `addr`, allocating a fresh program slot on first sight.
    /// Returns `(slot, newly_created)`.
    pub(crate) fn new_program(&mut self, addr: Address) -> Result<(usize, bool), VmError> {
        if let Some(&id) = self.load_id.get(&addr) {
            return Ok((id, false));
        }
        let id = self.mem.new_program()?;
        self.cpus.push(Cpu::new());
        self.addrs.push(addr);
        self.entries.push(0);
        self.load_id.insert(addr, id);
        Ok((id, true))
    }

    pub(crate) fn is_valid_jump_dest(&self, pc: u64) -> bool {
        self.jump_dest.contains(&pc)
    }

    /// Runs one call frame to completion, returning the callee's `a0`.
    ///
    /// Charges `GAS_CALL`, saves the target program's CPU state and restores
    /// it on the way out regardless of success.
    pub(crate) fn exec_vm(
        &mut self,
        slice: &Arc<Slice>,
        env: &mut ExecEnv,
        call: CallParams,
    ) -> Result<u64, VmError> {
        let prog = (call.pc >> 32) as usize;
        if prog >= MAX_LOADED_PROGRAMS {
            return Err(VmError::IllegalPc);
        }
        env.charge(GAS_CALL)?;
        if prog >= self.cpus.len() {
            return Err(VmError::SegFault);
        }
        let saved = self.cpus[prog];
        let result = self.run_frame(slice, env, &call, prog);
        self.cpus[prog] = saved;
        result
    }

    fn run_frame(
        &mut self,
        slice: &Arc<Slice>,
        env: &mut ExecEnv,
        call: &CallParams,
        prog: usize,
    ) -> Result<u64, VmError> {
        {
            let cpu = &mut self.cpus[prog];
            cpu.set_call(call.pc, RET_ADDR);
            for (i, arg) in call.args.iter().enumerate() {
                cpu.set_arg(i, *arg);
            }
        }
        loop {
            exec(&mut self.cpus[prog], &mut self.mem, env)?;
            loop {
                let pc = self.cpus[prog].pc;
                if pc >> 32 == prog as u64 {
                    break;
                }
                if pc == RET_ADDR {
                    return Ok(self.cpus[prog].arg(0));
                }
                if pc >> 32 == SYSCALL_PROG {
                    if pc & 3 != 0 {
                        return Err(VmError::InvalidSyscall);
                    }
                    let id = (1u64 << 63).wrapping_sub(pc) >> 2;
                    self.exec_syscall(slice, env, call, prog, id)?;
                    self.cpus[prog].ret();
                    continue;
                }
                if !self.is_valid_jump_dest(pc) {
                    return Err(VmError::InvalidJumpDest);
                }
                let args = vec![self.cpus[prog].arg(0), self.cpus[prog].arg(1)];
                let result = self.exec_vm(
                    slice,
                    env,
                    CallParams {
                        pc,
                        call_value: 0,
                        args,
                        caller: prog,
                        kind: CallKind::Regular,
                    },
                )?;
                self.cpus[prog].set_arg(0, result);
                self.cpus[prog].ret();
            }
        }
    }
}

/// Executes a type-2 transaction's raw code against `slice`.
///
/// Returns the remaining gas together with the execution result; the caller
/// decides whether the slice fork survives.
pub fn exec_vm_tx_raw_code(
    origin: Address,
    gas_limit: u64,
    data: &[u8],
    slice: &Arc<Slice>,
    ctx: &ExecutionContext,
    tx: Option<&Transaction>,
) -> (u64, Result<u64, VmError>) {
    if gas_limit < GAS_VM_TX_RAW_CODE {
        return (gas_limit, Err(VmError::InsufficientGas));
    }
    let mut env = ExecEnv::new(gas_limit - GAS_VM_TX_RAW_CODE);
    let mut vm = VmContext::new(ctx, origin, tx);
    let (id, _) = match vm.new_program(origin) {
        Ok(x) => x,
        Err(e) => return (env.gas, Err(e)),
    };
    if let Err(e) = vm
        .mem
        .program_mut(id)
        .load_raw_code(data, RAW_CODE_PC as u32, &mut env)
    {
        return (env.gas, Err(e));
    }
    vm.cpus[id].regs[2] = ((id as u64) << 32) | DEFAULT_SP;
    let result = vm.exec_vm(
        slice,
        &mut env,
        CallParams {
            pc: RAW_CODE_PC,
            call_value: 0,
            args: Vec::new(),
            caller: id,
            kind: CallKind::External,
        },
    );
    (env.gas, result)
}

/// Runs raw code in view mode and decodes its length-prefixed result buffer.
///
/// The returned `a0` must point at `u64 length || bytes` in readable memory;
/// the length is capped at 2^20 and charged one gas per byte.
pub fn exec_vm_view_raw_code(
    origin: Address,
    gas_limit: u64,
    data: &[u8],
    slice: &Arc<Slice>,
    ctx: &ExecutionContext,
) -> Result<Vec<u8>, VmError> {
    let mut env = ExecEnv::new(gas_limit);
    let mut vm = VmContext::new(ctx, origin, None);
    let (id, _) = vm.new_program(origin)?;
    vm.mem
        .program_mut(id)
        .load_raw_code(data, RAW_CODE_PC as u32, &mut env)?;
    vm.cpus[id].regs[2] = ((id as u64) << 32) | DEFAULT_SP;
    let ret = vm.exec_vm(
        slice,
        &mut env,
        CallParams {
            pc: RAW_CODE_PC,
            call_value: 0,
            args: Vec::new(),
            caller: id,
            kind: CallKind::View,
        },
    )?;

    let mut len_buf = [0u8; 8];
    vm.mem
        .read_bytes(id as u32, ret, &mut len_buf, &mut env)?;
    let n = u64::from_le_bytes(len_buf);
    if n > (1 << 20) {
        return Err(VmError::IllegalSyscallParameters);
    }
    env.charge(n)?;
    let mut out = vec![0u8; n as usize];
    vm.mem
        .read_bytes(id as u32, ret + 8, &mut out, &mut env)?;
    Ok(out)
}
