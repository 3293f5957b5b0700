//! Single-program execution loop.
//!
//! Drives the CPU over one program's code until the PC leaves the program's
//! 32-bit id: to the return sentinel, into the syscall pseudo-program, or
//! into another loaded program. What happens next is the caller's business
//! (see `context`); this loop only guarantees that every executed
//! instruction was fetched from the current program with execute privilege.

use crate::virtual_machine::cpu::{Cpu, MemoryBus};
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::gas::ExecEnv;
use crate::virtual_machine::memory::Memory;

/// Sentinel return address installed in x1 for the outermost frame.
pub const RET_ADDR: u64 = 0xdead_beef_0000_0000;

/// Program id of the syscall pseudo-program.
pub const SYSCALL_PROG: u64 = 0x7fff_ffff;

struct ProgramBus<'a> {
    mem: &'a mut Memory,
    prog: u32,
}

impl MemoryBus for ProgramBus<'_> {
    fn load(&mut self, addr: u64, env: &mut ExecEnv) -> Result<u64, VmError> {
        self.mem.read_word(self.prog, addr, env)
    }

    fn store(&mut self, addr: u64, val: u64, mask: u64, env: &mut ExecEnv) -> Result<(), VmError> {
        self.mem.write_word(self.prog, addr, val, mask, env)
    }
}

/// Runs `cpu` until its PC points outside the current program id.
///
/// Instructions are fetched through the containing 8-byte word, so a fresh
/// code page charges its page gas on first touch just like a data access.
pub fn exec(cpu: &mut Cpu, mem: &mut Memory, env: &mut ExecEnv) -> Result<(), VmError> {
    let prog = (cpu.pc >> 32) as u32;
    while cpu.pc >> 32 == prog as u64 {
        if cpu.pc & 3 != 0 {
            return Err(VmError::IllegalPc);
        }
        let word = mem.fetch_word(prog, cpu.pc, env)?;
        let insn = (word >> ((cpu.pc & 7) * 8)) as u32;
        let mut bus = ProgramBus { mem, prog };
        cpu.step(insn, env, &mut bus)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::asm;
    use crate::virtual_machine::gas::{GAS_INSTRUCTION_BASE, GAS_MEMORY_OP, GAS_MEMORY_PAGE};

    fn run_code(code: &[u8], gas: u64) -> (Cpu, Memory, ExecEnv, Result<(), VmError>) {
        let mut mem = Memory::new();
        mem.new_program().unwrap();
        let mut env = ExecEnv::new(gas);
        mem.program_mut(0)
            .load_raw_code(code, 0x1000_0000, &mut env)
            .expect("load");
        let mut cpu = Cpu::new();
        cpu.set_call(0x1000_0000, RET_ADDR);
        cpu.regs[2] = 0x3000_0000 + 0x1000; // stack
        let result = exec(&mut cpu, &mut mem, &mut env);
        (cpu, mem, env, result)
    }

    #[test]
    fn runs_to_the_return_sentinel() {
        let mut b = asm::CodeBuilder::new();
        b.li(asm::A0, 42);
        b.push(asm::ret());
        let (cpu, _, _, result) = run_code(&b.build(), 1_000_000);
        result.unwrap();
        assert_eq!(cpu.pc, RET_ADDR);
        assert_eq!(cpu.arg(0), 42);
    }

    #[test]
    fn loop_consumes_gas_until_exhaustion() {
        // beq x0, x0, 0 - a tight infinite loop
        let mut b = asm::CodeBuilder::new();
        b.push(asm::beq(0, 0, 0));
        let (_, _, env, result) = run_code(&b.build(), 100_000);
        assert_eq!(result, Err(VmError::InsufficientGas));
        assert!(env.gas < GAS_INSTRUCTION_BASE);
    }

    #[test]
    fn gas_accounting_for_straight_line_code() {
        let mut b = asm::CodeBuilder::new();
        b.li(asm::A0, 1);
        b.li(11, 2);
        b.push(asm::add(asm::A0, asm::A0, 11));
        b.push(asm::ret());
        let start = 1_000_000;
        let (cpu, _, env, result) = run_code(&b.build(), start);
        result.unwrap();
        assert_eq!(cpu.arg(0), 3);
        // 1 code page (load) + 1 code page fetch is the same page, so:
        // load_raw_code charged one page, 4 instructions charged base gas
        assert_eq!(env.gas, start - GAS_MEMORY_PAGE - 4 * GAS_INSTRUCTION_BASE);
    }

    #[test]
    fn store_touches_a_fresh_stack_page() {
        let mut b = asm::CodeBuilder::new();
        b.push(asm::sd(2, 0, 0)); // sd x0, 0(sp)
        b.push(asm::ret());
        let start = 1_000_000;
        let (_, _, env, result) = run_code(&b.build(), start);
        result.unwrap();
        assert_eq!(
            env.gas,
            start - 2 * GAS_MEMORY_PAGE - 2 * GAS_INSTRUCTION_BASE - GAS_MEMORY_OP
        );
    }

    #[test]
    fn misaligned_pc_faults() {
        let mut mem = Memory::new();
        mem.new_program().unwrap();
        let mut env = ExecEnv::new(1_000_000);
        mem.program_mut(0)
            .load_raw_code(&[0u8; 8], 0x1000_0000, &mut env)
            .unwrap();
        let mut cpu = Cpu::new();
        cpu.set_call(0x1000_0002, RET_ADDR);
        assert_eq!(
            exec(&mut cpu, &mut mem, &mut env),
            Err(VmError::IllegalPc)
        );
    }

    #[test]
    fn fetch_outside_code_faults() {
        let mut mem = Memory::new();
        mem.new_program().unwrap();
        let mut env = ExecEnv::new(1_000_000);
        let mut cpu = Cpu::new();
        cpu.set_call(0x1000_0000, RET_ADDR); // nothing loaded
        assert_eq!(exec(&mut cpu, &mut mem, &mut env), Err(VmError::SegFault));
    }

    #[test]
    fn leaves_loop_on_foreign_program_id() {
        // Jump to program 1's code block; exec() must stop, not fault
        let mut b = asm::CodeBuilder::new();
        b.li64(asm::T0, (1u64 << 32) | 0x1000_0000);
        b.push(asm::jalr(asm::RA, asm::T0, 0));
        let (cpu, _, _, result) = run_code(&b.build(), 1_000_000);
        result.unwrap();
        assert_eq!(cpu.pc, (1u64 << 32) | 0x1000_0000);
    }
}
