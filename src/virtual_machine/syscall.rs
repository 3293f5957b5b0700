//! Environment-call surface of the VM.
//!
//! A syscall is a jump whose target lies inside the reserved program id
//! `0x7FFFFFFF`: syscall `id` lives at pseudo-address `(-(id * 8)) >> 1`.
//! Every syscall charges its base cost before doing anything, then per-byte
//! or per-block surcharges where the table below says so.

use crate::core::account::{
    self, create_nonce_key, get_account_info, set_account_info, storage_slot_key,
};
use crate::storage::slice::{Key, Slice, Value};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::virtual_machine::context::{CallKind, CallParams, VmContext, DEFAULT_SP};
use crate::virtual_machine::elf;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::gas::{
    ExecEnv, GAS_LOAD_CONTRACT_CODE, GAS_LOAD_CONTRACT_CODE_CACHED,
    GAS_LOAD_CONTRACT_CODE_PER_BLOCK, GAS_SYSCALL_CREATE_PER_BYTE,
    GAS_SYSCALL_CREATE_STORE_PER_BLOCK, GAS_SYSCALL_ED25519_PER_BLOCK,
    GAS_SYSCALL_REVERT_PER_BYTE, GAS_SYSCALL_SHA256_PER_BLOCK,
    GAS_SYSCALL_TRANSFER_MESSAGE_PER_BYTE,
};
use crate::virtual_machine::memory::MAX_LOADED_PROGRAMS;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::sync::Arc;

pub const SYSCALL_SELF: u64 = 1;
pub const SYSCALL_ORIGIN: u64 = 2;
pub const SYSCALL_CALLER: u64 = 3;
pub const SYSCALL_CALLVALUE: u64 = 4;
pub const SYSCALL_STORAGE_STORE: u64 = 5;
pub const SYSCALL_STORAGE_LOAD: u64 = 6;
pub const SYSCALL_SHA256: u64 = 7;
pub const SYSCALL_BALANCE: u64 = 8;
pub const SYSCALL_LOAD_CONTRACT: u64 = 9;
pub const SYSCALL_PROTECTED_CALL: u64 = 10;
pub const SYSCALL_REVERT: u64 = 11;
pub const SYSCALL_TIME: u64 = 12;
pub const SYSCALL_MINER: u64 = 13;
pub const SYSCALL_BLOCK_NUMBER: u64 = 14;
pub const SYSCALL_DIFFICULTY: u64 = 15;
pub const SYSCALL_CHAINID: u64 = 16;
pub const SYSCALL_GAS: u64 = 17;
pub const SYSCALL_JUMPDEST: u64 = 18;
pub const SYSCALL_TRANSFER: u64 = 19;
pub const SYSCALL_CREATE: u64 = 20;
pub const SYSCALL_ED25519_VERIFY: u64 = 21;
pub const SYSCALL_LOAD_ELF: u64 = 22;

/// CREATE flag: trim the stored image.
pub const CREATE_TRIMELF: u64 = 1;
/// CREATE flag: run an INIT frame at the image entry first.
pub const CREATE_INIT: u64 = 2;
/// CREATE flag: take the nonce from a4 instead of the implicit counter.
pub const CREATE_USENONCE: u64 = 4;

/// Segment vaddr of the one-shot init code, dropped by TRIMELF.
const INIT_CODE_VADDR: u32 = 0x100f_f000;

/// Longest REVERT message in bytes.
pub const MAX_REVERT_MSG_LEN: usize = 1024;

/// Longest byte array a syscall accepts (hash inputs, messages, images).
pub const MAX_BYTE_ARRAY_LEN: u64 = 1 << 20;

/// Base gas cost per syscall.
pub fn syscall_base_gas(id: u64) -> Option<u64> {
    Some(match id {
        SYSCALL_SELF => 40,
        SYSCALL_ORIGIN => 40,
        SYSCALL_CALLER => 40,
        SYSCALL_CALLVALUE => 40,
        SYSCALL_STORAGE_STORE => 50_000,
        SYSCALL_STORAGE_LOAD => 50_000,
        SYSCALL_SHA256 => 400,
        SYSCALL_BALANCE => 20_000,
        SYSCALL_LOAD_CONTRACT => 500,
        SYSCALL_PROTECTED_CALL => 1_000,
        SYSCALL_REVERT => 500,
        SYSCALL_TIME => 40,
        SYSCALL_MINER => 40,
        SYSCALL_BLOCK_NUMBER => 40,
        SYSCALL_DIFFICULTY => 40,
        SYSCALL_CHAINID => 40,
        SYSCALL_GAS => 40,
        SYSCALL_JUMPDEST => 200,
        SYSCALL_TRANSFER => 40_000,
        SYSCALL_CREATE => 25_000,
        SYSCALL_ED25519_VERIFY => 50_000,
        SYSCALL_LOAD_ELF => 500,
        _ => return None,
    })
}

/// Writes into an execution slice. Execution only ever runs against
/// unfrozen forks, so a frozen-write here is an engine invariant violation.
fn write_state(slice: &Slice, key: Key, value: Value) -> Result<(), VmError> {
    slice
        .write(key, value)
        .map_err(|_| VmError::IllegalSyscallParameters)
}

impl<'a> VmContext<'a> {
    /// Fetches contract code, first from the per-invocation cache, then from
    /// the slice with the per-block surcharge.
    fn load_contract_code_metered(
        &mut self,
        slice: &Slice,
        env: &mut ExecEnv,
        addr: Address,
    ) -> Result<Vec<u8>, VmError> {
        if let Some(code) = self.elf_cache.get(&addr) {
            env.charge(GAS_LOAD_CONTRACT_CODE_CACHED)?;
            return Ok(code.clone());
        }
        env.charge(GAS_LOAD_CONTRACT_CODE)?;
        let len = account::contract_code_len(slice, &addr).ok_or(VmError::ContractNotExist)?;
        let blocks = len.div_ceil(32);
        env.charge(blocks * GAS_LOAD_CONTRACT_CODE_PER_BLOCK)?;
        let code = account::load_contract_code(slice, &addr).ok_or(VmError::ContractNotExist)?;
        self.elf_cache.insert(addr, code.clone());
        Ok(code)
    }

    /// Deterministic contract creation: derives the address, optionally runs
    /// the INIT frame and trims the image, then stores the code.
    fn create(
        &mut self,
        slice: &Arc<Slice>,
        env: &mut ExecEnv,
        caller_prog: usize,
        image: Vec<u8>,
        flags: u64,
        nonce: u64,
    ) -> Result<Address, VmError> {
        let mut image = image;
        let mut hasher = Hash::sha256();
        hasher.update(self.addrs[caller_prog].as_slice());
        hasher.update(&flags.to_le_bytes());
        hasher.update(&nonce.to_le_bytes());
        hasher.update(&image);
        let addr = Address::from(hasher.finalize());

        let (id, fresh) = self.new_program(addr)?;
        if !fresh {
            return Err(VmError::ContractExists);
        }
        if account::contract_code_len(slice, &addr).is_some() {
            return Err(VmError::ContractExists);
        }

        let mut new_entry: Option<u32> = None;
        if flags & CREATE_INIT != 0 {
            let entry = self.mem.program_mut(id).load_elf(&image, 0, env)?;
            self.cpus[id].regs[2] = ((id as u64) << 32) | DEFAULT_SP;
            let returned = self.exec_vm(
                slice,
                env,
                CallParams {
                    pc: ((id as u64) << 32) | entry as u64,
                    call_value: 0,
                    args: Vec::new(),
                    caller: caller_prog,
                    kind: CallKind::Init,
                },
            )?;
            if (returned >> 32) as usize != id {
                return Err(VmError::IllegalEntry);
            }
            new_entry = Some(returned as u32);
        }
        if flags & CREATE_TRIMELF != 0 {
            let parsed = elf::parse(&image)?;
            let entry = new_entry.unwrap_or(parsed.entry);
            image = elf::trim(&image, &parsed, &[INIT_CODE_VADDR], entry as u64)?;
        }

        let blocks = (image.len() as u64).div_ceil(32);
        env.charge(blocks * GAS_SYSCALL_CREATE_STORE_PER_BLOCK)?;
        account::store_contract_code(slice, &addr, &image)
            .map_err(|_| VmError::IllegalSyscallParameters)?;
        Ok(addr)
    }

    /// Dispatches one syscall for the frame currently running `prog`.
    pub(crate) fn exec_syscall(
        &mut self,
        slice: &Arc<Slice>,
        env: &mut ExecEnv,
        call: &CallParams,
        prog: usize,
        id: u64,
    ) -> Result<(), VmError> {
        let base = syscall_base_gas(id).ok_or(VmError::InvalidSyscall)?;
        env.charge(base)?;
        let sprog = prog as u32;

        match id {
            SYSCALL_SELF => {
                let addr = self.addrs[prog];
                let ptr = self.cpus[prog].arg(0);
                self.mem.write_bytes(sprog, ptr, addr.as_slice(), env)?;
            }
            SYSCALL_ORIGIN => {
                let origin = self.origin;
                let ptr = self.cpus[prog].arg(0);
                self.mem.write_bytes(sprog, ptr, origin.as_slice(), env)?;
            }
            SYSCALL_CALLER => {
                let addr = self.addrs[call.caller];
                let ptr = self.cpus[prog].arg(0);
                self.mem.write_bytes(sprog, ptr, addr.as_slice(), env)?;
            }
            SYSCALL_CALLVALUE => {
                self.cpus[prog].set_arg(0, call.call_value);
            }
            SYSCALL_STORAGE_STORE => {
                let mut slot = [0u8; 32];
                let mut value = [0u8; 32];
                let slot_ptr = self.cpus[prog].arg(0);
                let value_ptr = self.cpus[prog].arg(1);
                self.mem.read_bytes(sprog, slot_ptr, &mut slot, env)?;
                self.mem.read_bytes(sprog, value_ptr, &mut value, env)?;
                write_state(slice, storage_slot_key(&self.addrs[prog], &slot), value)?;
            }
            SYSCALL_STORAGE_LOAD => {
                let mut slot = [0u8; 32];
                let slot_ptr = self.cpus[prog].arg(0);
                let value_ptr = self.cpus[prog].arg(1);
                self.mem.read_bytes(sprog, slot_ptr, &mut slot, env)?;
                let value = slice.read(&storage_slot_key(&self.addrs[prog], &slot));
                self.mem.write_bytes(sprog, value_ptr, &value, env)?;
            }
            SYSCALL_SHA256 => {
                let n = self.cpus[prog].arg(1);
                if n > MAX_BYTE_ARRAY_LEN {
                    return Err(VmError::IllegalSyscallParameters);
                }
                let blocks = (n + 64) / 64;
                env.charge(blocks * GAS_SYSCALL_SHA256_PER_BLOCK)?;
                let mut buf = vec![0u8; n as usize];
                let data_ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, data_ptr, &mut buf, env)?;
                let digest = Hash::digest(&buf);
                let out_ptr = self.cpus[prog].arg(2);
                self.mem.write_bytes(sprog, out_ptr, digest.as_slice(), env)?;
            }
            SYSCALL_BALANCE => {
                let mut raw = [0u8; 32];
                let ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, ptr, &mut raw, env)?;
                let info = get_account_info(slice, &Address(raw));
                self.cpus[prog].set_arg(0, info.balance);
            }
            SYSCALL_LOAD_CONTRACT => {
                let mut raw = [0u8; 32];
                let ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, ptr, &mut raw, env)?;
                let addr = Address(raw);
                let (target, fresh) = self.new_program(addr)?;
                if fresh {
                    let code = self.load_contract_code_metered(slice, env, addr)?;
                    let entry = self.mem.program_mut(target).load_elf(&code, 0, env)?;
                    self.cpus[target].regs[2] = ((target as u64) << 32) | DEFAULT_SP;
                    let returned = self.exec_vm(
                        slice,
                        env,
                        CallParams {
                            pc: ((target as u64) << 32) | entry as u64,
                            call_value: 0,
                            args: Vec::new(),
                            caller: prog,
                            kind: CallKind::Start,
                        },
                    )?;
                    if (returned >> 32) as usize != target {
                        return Err(VmError::IllegalEntry);
                    }
                    self.entries[target] = returned as u32;
                }
                self.cpus[prog].set_arg(
                    0,
                    ((target as u64) << 32) + self.entries[target] as u64,
                );
            }
            SYSCALL_PROTECTED_CALL => {
                let call_pc = self.cpus[prog].arg(0);
                let call_value = self.cpus[prog].arg(3);
                let gas_cap = self.cpus[prog].arg(4);
                let callee_prog = (call_pc >> 32) as usize;
                if callee_prog >= MAX_LOADED_PROGRAMS || callee_prog >= self.addrs.len() {
                    return Err(VmError::IllegalSyscallParameters);
                }
                let fork = Slice::fork(slice);
                if call_value != 0 {
                    env.charge(syscall_base_gas(SYSCALL_TRANSFER).unwrap_or(0))?;
                    let mut self_info = get_account_info(&fork, &self.addrs[prog]);
                    if self_info.balance < call_value {
                        return Err(VmError::InsufficientBalance);
                    }
                    let mut target_info = get_account_info(&fork, &self.addrs[callee_prog]);
                    self_info.balance -= call_value;
                    target_info.balance += call_value;
                    set_account_info(&fork, &self.addrs[prog], self_info)
                        .map_err(|_| VmError::IllegalSyscallParameters)?;
                    set_account_info(&fork, &self.addrs[callee_prog], target_info)
                        .map_err(|_| VmError::IllegalSyscallParameters)?;
                }
                self.ctx.notify_transfer(
                    &fork,
                    self.addrs[prog],
                    self.addrs[callee_prog],
                    call_value,
                    &[],
                    self.tx,
                );
                let gas_cap = gas_cap.min(env.gas);
                let mut callee_env = ExecEnv::new(gas_cap);
                let args = vec![self.cpus[prog].arg(1), self.cpus[prog].arg(2)];
                let result = self.exec_vm(
                    &fork,
                    &mut callee_env,
                    CallParams {
                        pc: call_pc,
                        call_value,
                        args,
                        caller: prog,
                        kind: CallKind::Regular,
                    },
                );
                env.gas -= gas_cap - callee_env.gas;
                match result {
                    Err(err) => {
                        let ok_ptr = self.cpus[prog].arg(5);
                        self.mem.write_bytes(sprog, ok_ptr, &[0], env)?;
                        let mut msg = err.to_string().into_bytes();
                        msg.push(0);
                        let msg_ptr = self.cpus[prog].arg(6);
                        self.mem.write_bytes(sprog, msg_ptr, &msg, env)?;
                    }
                    Ok(ret) => {
                        let ok_ptr = self.cpus[prog].arg(5);
                        self.mem.write_bytes(sprog, ok_ptr, &[1], env)?;
                        fork.merge();
                        self.cpus[prog].set_arg(0, ret);
                    }
                }
            }
            SYSCALL_REVERT => {
                let msg_ptr = self.cpus[prog].arg(0);
                let msg = self
                    .mem
                    .read_cstring(sprog, msg_ptr, MAX_REVERT_MSG_LEN, env)?;
                env.charge(msg.len() as u64 * GAS_SYSCALL_REVERT_PER_BYTE)?;
                return Err(VmError::Reverted(
                    String::from_utf8_lossy(&msg).into_owned(),
                ));
            }
            SYSCALL_TIME => {
                self.cpus[prog].set_arg(0, self.ctx.time);
            }
            SYSCALL_MINER => {
                let miner = self.ctx.miner;
                let ptr = self.cpus[prog].arg(0);
                self.mem.write_bytes(sprog, ptr, miner.as_slice(), env)?;
            }
            SYSCALL_BLOCK_NUMBER => {
                self.cpus[prog].set_arg(0, self.ctx.height as u64);
            }
            SYSCALL_DIFFICULTY => {
                let difficulty = self.ctx.difficulty;
                let ptr = self.cpus[prog].arg(0);
                self.mem
                    .write_bytes(sprog, ptr, difficulty.as_slice(), env)?;
            }
            SYSCALL_CHAINID => {
                self.cpus[prog].set_arg(0, self.ctx.chain_id as u64);
            }
            SYSCALL_GAS => {
                let gas = env.gas;
                self.cpus[prog].set_arg(0, gas);
            }
            SYSCALL_JUMPDEST => {
                let target = self.cpus[prog].arg(0);
                if target >> 32 != prog as u64 {
                    return Err(VmError::IllegalSyscallParameters);
                }
                self.jump_dest.insert(target);
            }
            SYSCALL_TRANSFER => {
                let mut raw = [0u8; 32];
                let addr_ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, addr_ptr, &mut raw, env)?;
                let to = Address(raw);
                let value = self.cpus[prog].arg(1);
                let mut self_info = get_account_info(slice, &self.addrs[prog]);
                if self_info.balance < value {
                    return Err(VmError::InsufficientBalance);
                }
                let n = self.cpus[prog].arg(3);
                if n > MAX_BYTE_ARRAY_LEN {
                    return Err(VmError::IllegalSyscallParameters);
                }
                env.charge(n * GAS_SYSCALL_TRANSFER_MESSAGE_PER_BYTE)?;
                let mut msg = vec![0u8; n as usize];
                let msg_ptr = self.cpus[prog].arg(2);
                self.mem.read_bytes(sprog, msg_ptr, &mut msg, env)?;
                let mut target_info = get_account_info(slice, &to);
                self_info.balance -= value;
                target_info.balance += value;
                set_account_info(slice, &self.addrs[prog], self_info)
                    .map_err(|_| VmError::IllegalSyscallParameters)?;
                set_account_info(slice, &to, target_info)
                    .map_err(|_| VmError::IllegalSyscallParameters)?;
                self.ctx
                    .notify_transfer(slice, self.addrs[prog], to, value, &msg, self.tx);
            }
            SYSCALL_CREATE => {
                let n = self.cpus[prog].arg(2);
                if n > MAX_BYTE_ARRAY_LEN {
                    return Err(VmError::IllegalSyscallParameters);
                }
                env.charge(n * GAS_SYSCALL_CREATE_PER_BYTE)?;
                let mut image = vec![0u8; n as usize];
                let image_ptr = self.cpus[prog].arg(1);
                self.mem.read_bytes(sprog, image_ptr, &mut image, env)?;
                let flags = self.cpus[prog].arg(3);
                let mut nonce = self.cpus[prog].arg(4);
                if flags & CREATE_USENONCE == 0 {
                    let key = create_nonce_key(&self.addrs[prog]);
                    let mut val = slice.read(&key);
                    nonce = u64::from_le_bytes(val[..8].try_into().unwrap());
                    val[..8].copy_from_slice(&(nonce + 1).to_le_bytes());
                    write_state(slice, key, val)?;
                }
                let addr = self.create(slice, env, prog, image, flags, nonce)?;
                let out_ptr = self.cpus[prog].arg(0);
                self.mem.write_bytes(sprog, out_ptr, addr.as_slice(), env)?;
            }
            SYSCALL_ED25519_VERIFY => {
                let n = self.cpus[prog].arg(1);
                if n > MAX_BYTE_ARRAY_LEN {
                    return Err(VmError::IllegalSyscallParameters);
                }
                let blocks = n.div_ceil(128);
                env.charge(blocks * GAS_SYSCALL_ED25519_PER_BLOCK)?;
                let mut msg = vec![0u8; n as usize];
                let msg_ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, msg_ptr, &mut msg, env)?;
                let mut pk = [0u8; 32];
                let pk_ptr = self.cpus[prog].arg(2);
                self.mem.read_bytes(sprog, pk_ptr, &mut pk, env)?;
                let mut sig = [0u8; 64];
                let sig_ptr = self.cpus[prog].arg(3);
                self.mem.read_bytes(sprog, sig_ptr, &mut sig, env)?;
                let valid = VerifyingKey::from_bytes(&pk)
                    .map(|key| key.verify(&msg, &Signature::from_bytes(&sig)).is_ok())
                    .unwrap_or(false);
                self.cpus[prog].set_arg(0, valid as u64);
            }
            SYSCALL_LOAD_ELF => {
                if call.kind != CallKind::Init {
                    return Err(VmError::IllegalSyscallParameters);
                }
                let mut raw = [0u8; 32];
                let ptr = self.cpus[prog].arg(0);
                self.mem.read_bytes(sprog, ptr, &mut raw, env)?;
                let code = self.load_contract_code_metered(slice, env, Address(raw))?;
                let offset = self.cpus[prog].arg(1) as u32;
                let entry = self.mem.program_mut(prog).load_elf(&code, offset, env)?;
                self.cpus[prog].set_arg(0, entry as u64);
            }
            _ => return Err(VmError::InvalidSyscall),
        }
        Ok(())
    }
}
