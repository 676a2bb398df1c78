//! Instruction semantics.
//!
//! One function implements every instruction; the interpreter and
//! the threaded backend both call it, so a block behaves the same
//! whichever tier runs it.

use tcg_core::GuestFault;

use super::cpu::{RiscvCpu, MSTATUS_MIE, MSTATUS_MPIE};
use super::insn::{Insn, Op};
use crate::Bus;

/// Control-flow outcome of one retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue at `pc + len`.
    Next,
    /// Continue at the given target.
    Jump(u64),
}

impl Flow {
    /// Address of the next instruction.
    pub fn next_pc(self, pc: u64, len: u8) -> u64 {
        match self {
            Flow::Next => pc.wrapping_add(len as u64),
            Flow::Jump(t) => t,
        }
    }
}

/// Execute `insn` located at `pc`.
///
/// On success the instruction has retired: registers are written
/// and `instret` is incremented. On a fault nothing is written;
/// `cpu.pc` is never touched, that is the caller's job.
pub fn execute<B: Bus + ?Sized>(
    cpu: &mut RiscvCpu,
    insn: &Insn,
    pc: u64,
    bus: &mut B,
) -> Result<Flow, GuestFault> {
    use Op::*;
    let rs1 = cpu.reg(insn.rs1);
    let rs2 = cpu.reg(insn.rs2);
    let imm = insn.imm;
    let uimm = imm as u64;
    let shamt = (imm & 0x3f) as u32;
    let mut flow = Flow::Next;

    let result: Option<u64> = match insn.op {
        Lui => Some(uimm),
        Auipc => Some(pc.wrapping_add(uimm)),
        Jal => {
            flow = Flow::Jump(pc.wrapping_add(uimm));
            Some(pc.wrapping_add(insn.len as u64))
        }
        Jalr => {
            flow = Flow::Jump(rs1.wrapping_add(uimm) & !1);
            Some(pc.wrapping_add(insn.len as u64))
        }
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            let taken = match insn.op {
                Beq => rs1 == rs2,
                Bne => rs1 != rs2,
                Blt => (rs1 as i64) < (rs2 as i64),
                Bge => (rs1 as i64) >= (rs2 as i64),
                Bltu => rs1 < rs2,
                _ => rs1 >= rs2,
            };
            if taken {
                flow = Flow::Jump(pc.wrapping_add(uimm));
            }
            None
        }
        Lb | Lh | Lw | Ld | Lbu | Lhu | Lwu => {
            let (size, signed) = match insn.op {
                Lb => (1, true),
                Lh => (2, true),
                Lw => (4, true),
                Ld => (8, false),
                Lbu => (1, false),
                Lhu => (2, false),
                _ => (4, false),
            };
            let addr = rs1.wrapping_add(uimm);
            if addr % size as u64 != 0 {
                return Err(GuestFault::LoadMisaligned(addr));
            }
            let raw = bus.load(addr, size)?;
            Some(if signed { sext(raw, size) } else { raw })
        }
        Sb | Sh | Sw | Sd => {
            let size = match insn.op {
                Sb => 1,
                Sh => 2,
                Sw => 4,
                _ => 8,
            };
            let addr = rs1.wrapping_add(uimm);
            if addr % size as u64 != 0 {
                return Err(GuestFault::StoreMisaligned(addr));
            }
            bus.store(addr, size, rs2)?;
            None
        }
        Addi => Some(rs1.wrapping_add(uimm)),
        Slti => Some(((rs1 as i64) < imm) as u64),
        Sltiu => Some((rs1 < uimm) as u64),
        Xori => Some(rs1 ^ uimm),
        Ori => Some(rs1 | uimm),
        Andi => Some(rs1 & uimm),
        Slli => Some(rs1 << shamt),
        Srli => Some(rs1 >> shamt),
        Srai => Some(((rs1 as i64) >> shamt) as u64),
        Add => Some(rs1.wrapping_add(rs2)),
        Sub => Some(rs1.wrapping_sub(rs2)),
        Sll => Some(rs1 << (rs2 & 0x3f)),
        Slt => Some(((rs1 as i64) < (rs2 as i64)) as u64),
        Sltu => Some((rs1 < rs2) as u64),
        Xor => Some(rs1 ^ rs2),
        Srl => Some(rs1 >> (rs2 & 0x3f)),
        Sra => Some(((rs1 as i64) >> (rs2 & 0x3f)) as u64),
        Or => Some(rs1 | rs2),
        And => Some(rs1 & rs2),
        Addiw => Some(word(rs1.wrapping_add(uimm) as u32)),
        Slliw => Some(word((rs1 as u32) << shamt)),
        Srliw => Some(word((rs1 as u32) >> shamt)),
        Sraiw => Some(word(((rs1 as i32) >> shamt) as u32)),
        Addw => Some(word((rs1 as u32).wrapping_add(rs2 as u32))),
        Subw => Some(word((rs1 as u32).wrapping_sub(rs2 as u32))),
        Sllw => Some(word((rs1 as u32) << (rs2 & 0x1f))),
        Srlw => Some(word((rs1 as u32) >> (rs2 & 0x1f))),
        Sraw => Some(word(((rs1 as i32) >> (rs2 & 0x1f)) as u32)),
        // Single hart, no caches to maintain: fences only end the block.
        Fence | FenceI | Wfi => None,
        Ecall => return Err(GuestFault::EnvironmentCall),
        Ebreak => return Err(GuestFault::Breakpoint(pc)),
        Mret => {
            let mpie = cpu.mstatus & MSTATUS_MPIE != 0;
            cpu.mstatus &= !MSTATUS_MIE;
            if mpie {
                cpu.mstatus |= MSTATUS_MIE;
            }
            cpu.mstatus |= MSTATUS_MPIE;
            flow = Flow::Jump(cpu.mepc);
            None
        }
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => {
            return csr_op(cpu, insn, rs1, pc);
        }
    };

    if let Some(val) = result {
        cpu.set_reg(insn.rd, val);
    }
    cpu.instret = cpu.instret.wrapping_add(1);
    Ok(flow)
}

fn csr_op(
    cpu: &mut RiscvCpu,
    insn: &Insn,
    rs1: u64,
    pc: u64,
) -> Result<Flow, GuestFault> {
    use Op::*;
    let csr = insn.imm as u16;
    let illegal = || GuestFault::IllegalInstruction(0);
    let src = match insn.op {
        Csrrwi | Csrrsi | Csrrci => insn.rs1 as u64,
        _ => rs1,
    };
    let old = cpu.csr_read(csr).ok_or_else(illegal)?;
    let new = match insn.op {
        Csrrw | Csrrwi => Some(src),
        // Set/clear with a zero source do not write.
        Csrrs | Csrrsi if insn.rs1 != 0 => Some(old | src),
        Csrrc | Csrrci if insn.rs1 != 0 => Some(old & !src),
        _ => None,
    };
    if let Some(val) = new {
        if !cpu.csr_write(csr, val) {
            log::trace!("[tcg-exec] write to read-only csr {csr:#x} at {pc:#x}");
            return Err(illegal());
        }
    }
    cpu.set_reg(insn.rd, old);
    cpu.instret = cpu.instret.wrapping_add(1);
    Ok(Flow::Next)
}

fn sext(val: u64, size: u8) -> u64 {
    let shift = 64 - 8 * size as u32;
    (((val << shift) as i64) >> shift) as u64
}

fn word(val: u32) -> u64 {
    val as i32 as i64 as u64
}
