//! Threaded-code record format.
//!
//! Every record is 16 bytes, little endian:
//!
//! ```text
//!  0      1     2    3     4     5     6        8          12     14
//! [kind] [op] [rd] [rs1] [rs2] [len] [pc_off:2] [imm:4]    [aux:2][pad:2]
//! ```
//!
//! `pc_off` is the guest PC relative to the block entry, which keeps
//! compiled code valid for every VA that maps the block's PA.

use tcg_frontend::riscv::{Insn, Op};

use crate::CodeBuffer;

/// Size of one record in bytes.
pub const UOP_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UopKind {
    /// Execute one guest instruction.
    Insn = 0,
    /// Poll for interrupts. `imm` is the safepoint interval.
    Safepoint = 1,
    /// Backward branch; taken arm resumes at record `aux`.
    LoopBranch = 2,
    /// Leave the block, continuing at `pc_off`.
    Exit = 3,
}

impl UopKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Insn),
            1 => Some(Self::Safepoint),
            2 => Some(Self::LoopBranch),
            3 => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uop {
    pub kind: UopKind,
    pub op: u8,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub len: u8,
    pub pc_off: u16,
    pub imm: i32,
    pub aux: u16,
}

impl Uop {
    pub fn control(kind: UopKind, pc_off: u16, imm: i32, aux: u16) -> Self {
        Self {
            kind,
            op: 0,
            rd: 0,
            rs1: 0,
            rs2: 0,
            len: 0,
            pc_off,
            imm,
            aux,
        }
    }

    pub fn from_insn(kind: UopKind, insn: &Insn, pc_off: u16, aux: u16) -> Self {
        Self {
            kind,
            op: insn.op as u8,
            rd: insn.rd,
            rs1: insn.rs1,
            rs2: insn.rs2,
            len: insn.len,
            pc_off,
            // Every RV64 immediate, and every CSR number, fits in 32 bits.
            imm: insn.imm as i32,
            aux,
        }
    }

    /// Rebuild the guest instruction of an `Insn`/`LoopBranch` record.
    pub fn insn(&self) -> Option<Insn> {
        Some(Insn {
            op: Op::from_u8(self.op)?,
            rd: self.rd,
            rs1: self.rs1,
            rs2: self.rs2,
            imm: self.imm as i64,
            len: self.len,
        })
    }

    pub fn encode(&self, buf: &mut CodeBuffer) {
        buf.emit_u8(self.kind as u8);
        buf.emit_u8(self.op);
        buf.emit_u8(self.rd);
        buf.emit_u8(self.rs1);
        buf.emit_u8(self.rs2);
        buf.emit_u8(self.len);
        buf.emit_u16(self.pc_off);
        buf.emit_u32(self.imm as u32);
        buf.emit_u16(self.aux);
        buf.emit_u16(0);
    }

    /// Decode record number `index` of `code`.
    pub fn decode(code: &[u8], index: usize) -> Option<Self> {
        let start = index.checked_mul(UOP_SIZE)?;
        let r = code.get(start..start + UOP_SIZE)?;
        Some(Self {
            kind: UopKind::from_u8(r[0])?,
            op: r[1],
            rd: r[2],
            rs1: r[3],
            rs2: r[4],
            len: r[5],
            pc_off: u16::from_le_bytes([r[6], r[7]]),
            imm: i32::from_le_bytes([r[8], r[9], r[10], r[11]]),
            aux: u16::from_le_bytes([r[12], r[13]]),
        })
    }
}
