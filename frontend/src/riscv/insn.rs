//! RISC-V instruction decoder: RV64I, Zicsr, and the C subset.
//!
//! Compressed instructions are expanded to the equivalent 32-bit
//! [`Insn`] with `len == 2`, so everything downstream handles one
//! instruction shape.

use std::fmt;

use tcg_core::GuestFault;

macro_rules! ops {
    ($($name:ident => $mnemonic:literal,)*) => {
        /// Decoded operation. The discriminant is stable and is what
        /// backends serialize into host code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            const ALL: &'static [Op] = &[$(Op::$name,)*];

            pub fn from_u8(v: u8) -> Option<Op> {
                Self::ALL.get(v as usize).copied()
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Op::$name => $mnemonic,)*
                }
            }
        }
    };
}

ops! {
    Lui => "lui",
    Auipc => "auipc",
    Jal => "jal",
    Jalr => "jalr",
    Beq => "beq",
    Bne => "bne",
    Blt => "blt",
    Bge => "bge",
    Bltu => "bltu",
    Bgeu => "bgeu",
    Lb => "lb",
    Lh => "lh",
    Lw => "lw",
    Ld => "ld",
    Lbu => "lbu",
    Lhu => "lhu",
    Lwu => "lwu",
    Sb => "sb",
    Sh => "sh",
    Sw => "sw",
    Sd => "sd",
    Addi => "addi",
    Slti => "slti",
    Sltiu => "sltiu",
    Xori => "xori",
    Ori => "ori",
    Andi => "andi",
    Slli => "slli",
    Srli => "srli",
    Srai => "srai",
    Add => "add",
    Sub => "sub",
    Sll => "sll",
    Slt => "slt",
    Sltu => "sltu",
    Xor => "xor",
    Srl => "srl",
    Sra => "sra",
    Or => "or",
    And => "and",
    Addiw => "addiw",
    Slliw => "slliw",
    Srliw => "srliw",
    Sraiw => "sraiw",
    Addw => "addw",
    Subw => "subw",
    Sllw => "sllw",
    Srlw => "srlw",
    Sraw => "sraw",
    Fence => "fence",
    FenceI => "fence.i",
    Ecall => "ecall",
    Ebreak => "ebreak",
    Mret => "mret",
    Wfi => "wfi",
    Csrrw => "csrrw",
    Csrrs => "csrrs",
    Csrrc => "csrrc",
    Csrrwi => "csrrwi",
    Csrrsi => "csrrsi",
    Csrrci => "csrrci",
}

/// How an instruction affects basic-block formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnClass {
    /// Falls through to `pc + len`.
    Sequential,
    /// Conditional branch or JAL with a PC-relative target.
    DirectBranch,
    /// JALR: target computed from a register.
    IndirectJump,
    /// Changes state translation depends on (CSRs, fences, MRET,
    /// WFI). Must be the last instruction of a block.
    Serializing,
    /// Always raises an exception (ECALL, EBREAK).
    Trap,
}

/// A decoded instruction.
///
/// CSR instructions keep the CSR number in `imm`; the immediate
/// CSR forms keep their 5-bit immediate in `rs1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub op: Op,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i64,
    /// Encoded length in bytes (2 or 4).
    pub len: u8,
}

impl Insn {
    fn new(op: Op, rd: u32, rs1: u32, rs2: u32, imm: i64) -> Self {
        Self {
            op,
            rd: rd as u8,
            rs1: rs1 as u8,
            rs2: rs2 as u8,
            imm,
            len: 4,
        }
    }

    fn compressed(mut self) -> Self {
        self.len = 2;
        self
    }

    pub fn class(&self) -> InsnClass {
        use Op::*;
        match self.op {
            Jal | Beq | Bne | Blt | Bge | Bltu | Bgeu => InsnClass::DirectBranch,
            Jalr => InsnClass::IndirectJump,
            Fence | FenceI | Mret | Wfi | Csrrw | Csrrs | Csrrc | Csrrwi
            | Csrrsi | Csrrci => InsnClass::Serializing,
            Ecall | Ebreak => InsnClass::Trap,
            _ => InsnClass::Sequential,
        }
    }

    /// Whether this instruction must be the last of a basic block.
    pub fn ends_block(&self) -> bool {
        self.class() != InsnClass::Sequential
    }

    /// Taken target of a direct branch at `pc`.
    pub fn direct_target(&self, pc: u64) -> Option<u64> {
        match self.class() {
            InsnClass::DirectBranch => Some(pc.wrapping_add(self.imm as u64)),
            _ => None,
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self.op,
            Op::Lb | Op::Lh | Op::Lw | Op::Ld | Op::Lbu | Op::Lhu | Op::Lwu
        )
    }

    pub fn is_store(&self) -> bool {
        matches!(self.op, Op::Sb | Op::Sh | Op::Sw | Op::Sd)
    }

    fn is_cond_branch(&self) -> bool {
        matches!(
            self.op,
            Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu
        )
    }
}

/// Length of the instruction whose first 16-bit parcel is `parcel`.
#[inline]
pub fn insn_len(parcel: u16) -> usize {
    if parcel & 0x3 == 0x3 {
        4
    } else {
        2
    }
}

/// Decode one instruction from `bytes` (little endian).
///
/// `bytes` must hold at least [`insn_len`] bytes; a short buffer
/// decodes as illegal.
pub fn decode(bytes: &[u8]) -> Result<Insn, GuestFault> {
    let (Some(&b0), Some(&b1)) = (bytes.first(), bytes.get(1)) else {
        return Err(GuestFault::IllegalInstruction(0));
    };
    let half = u16::from_le_bytes([b0, b1]);
    if insn_len(half) == 2 {
        return decode16(half as u32)
            .map(Insn::compressed)
            .ok_or(GuestFault::IllegalInstruction(half as u32));
    }
    match bytes.get(..4) {
        Some(&[b0, b1, b2, b3]) => {
            let word = u32::from_le_bytes([b0, b1, b2, b3]);
            decode32(word).ok_or(GuestFault::IllegalInstruction(word))
        }
        _ => Err(GuestFault::IllegalInstruction(half as u32)),
    }
}

fn sign_ext(val: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    ((val << shift) as i32 >> shift) as i64
}

// ================================================================
// 32-bit encodings
// ================================================================

fn jtype_imm(w: u32) -> i64 {
    let b20 = (w >> 31) & 1;
    let b10_1 = (w >> 21) & 0x3ff;
    let b11 = (w >> 20) & 1;
    let b19_12 = (w >> 12) & 0xff;
    sign_ext((b20 << 20) | (b19_12 << 12) | (b11 << 11) | (b10_1 << 1), 21)
}

fn btype_imm(w: u32) -> i64 {
    let b12 = (w >> 31) & 1;
    let b10_5 = (w >> 25) & 0x3f;
    let b4_1 = (w >> 8) & 0xf;
    let b11 = (w >> 7) & 1;
    sign_ext((b12 << 12) | (b11 << 11) | (b10_5 << 5) | (b4_1 << 1), 13)
}

fn stype_imm(w: u32) -> i64 {
    sign_ext(((w >> 25) << 5) | ((w >> 7) & 0x1f), 12)
}

fn itype_imm(w: u32) -> i64 {
    sign_ext(w >> 20, 12)
}

fn decode32(w: u32) -> Option<Insn> {
    use Op::*;
    let rd = (w >> 7) & 0x1f;
    let f3 = (w >> 12) & 0x7;
    let rs1 = (w >> 15) & 0x1f;
    let rs2 = (w >> 20) & 0x1f;
    let f7 = w >> 25;

    let insn = match w & 0x7f {
        0x37 => Insn::new(Lui, rd, 0, 0, (w & 0xffff_f000) as i32 as i64),
        0x17 => Insn::new(Auipc, rd, 0, 0, (w & 0xffff_f000) as i32 as i64),
        0x6f => Insn::new(Jal, rd, 0, 0, jtype_imm(w)),
        0x67 if f3 == 0 => Insn::new(Jalr, rd, rs1, 0, itype_imm(w)),
        0x63 => {
            let op = match f3 {
                0 => Beq,
                1 => Bne,
                4 => Blt,
                5 => Bge,
                6 => Bltu,
                7 => Bgeu,
                _ => return None,
            };
            Insn::new(op, 0, rs1, rs2, btype_imm(w))
        }
        0x03 => {
            let op = match f3 {
                0 => Lb,
                1 => Lh,
                2 => Lw,
                3 => Ld,
                4 => Lbu,
                5 => Lhu,
                6 => Lwu,
                _ => return None,
            };
            Insn::new(op, rd, rs1, 0, itype_imm(w))
        }
        0x23 => {
            let op = match f3 {
                0 => Sb,
                1 => Sh,
                2 => Sw,
                3 => Sd,
                _ => return None,
            };
            Insn::new(op, 0, rs1, rs2, stype_imm(w))
        }
        0x13 => {
            let shamt = ((w >> 20) & 0x3f) as i64;
            match (f3, w >> 26) {
                (0, _) => Insn::new(Addi, rd, rs1, 0, itype_imm(w)),
                (2, _) => Insn::new(Slti, rd, rs1, 0, itype_imm(w)),
                (3, _) => Insn::new(Sltiu, rd, rs1, 0, itype_imm(w)),
                (4, _) => Insn::new(Xori, rd, rs1, 0, itype_imm(w)),
                (6, _) => Insn::new(Ori, rd, rs1, 0, itype_imm(w)),
                (7, _) => Insn::new(Andi, rd, rs1, 0, itype_imm(w)),
                (1, 0) => Insn::new(Slli, rd, rs1, 0, shamt),
                (5, 0) => Insn::new(Srli, rd, rs1, 0, shamt),
                (5, 0x10) => Insn::new(Srai, rd, rs1, 0, shamt),
                _ => return None,
            }
        }
        0x1b => {
            let shamt = ((w >> 20) & 0x1f) as i64;
            match (f3, f7) {
                (0, _) => Insn::new(Addiw, rd, rs1, 0, itype_imm(w)),
                (1, 0) => Insn::new(Slliw, rd, rs1, 0, shamt),
                (5, 0) => Insn::new(Srliw, rd, rs1, 0, shamt),
                (5, 0x20) => Insn::new(Sraiw, rd, rs1, 0, shamt),
                _ => return None,
            }
        }
        0x33 => {
            let op = match (f3, f7) {
                (0, 0) => Add,
                (0, 0x20) => Sub,
                (1, 0) => Sll,
                (2, 0) => Slt,
                (3, 0) => Sltu,
                (4, 0) => Xor,
                (5, 0) => Srl,
                (5, 0x20) => Sra,
                (6, 0) => Or,
                (7, 0) => And,
                _ => return None,
            };
            Insn::new(op, rd, rs1, rs2, 0)
        }
        0x3b => {
            let op = match (f3, f7) {
                (0, 0) => Addw,
                (0, 0x20) => Subw,
                (1, 0) => Sllw,
                (5, 0) => Srlw,
                (5, 0x20) => Sraw,
                _ => return None,
            };
            Insn::new(op, rd, rs1, rs2, 0)
        }
        0x0f => match f3 {
            0 => Insn::new(Fence, 0, 0, 0, 0),
            1 => Insn::new(FenceI, 0, 0, 0, 0),
            _ => return None,
        },
        0x73 => {
            let csr = (w >> 20) as i64;
            match f3 {
                0 => match w {
                    0x0000_0073 => Insn::new(Ecall, 0, 0, 0, 0),
                    0x0010_0073 => Insn::new(Ebreak, 0, 0, 0, 0),
                    0x3020_0073 => Insn::new(Mret, 0, 0, 0, 0),
                    0x1050_0073 => Insn::new(Wfi, 0, 0, 0, 0),
                    _ => return None,
                },
                1 => Insn::new(Csrrw, rd, rs1, 0, csr),
                2 => Insn::new(Csrrs, rd, rs1, 0, csr),
                3 => Insn::new(Csrrc, rd, rs1, 0, csr),
                5 => Insn::new(Csrrwi, rd, rs1, 0, csr),
                6 => Insn::new(Csrrsi, rd, rs1, 0, csr),
                7 => Insn::new(Csrrci, rd, rs1, 0, csr),
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(insn)
}

// ================================================================
// 16-bit compressed encodings
// ================================================================

/// Compressed register field (3 bits, maps to x8–x15).
fn creg(r: u32) -> u32 {
    8 + (r & 0x7)
}

fn c_imm6(h: u32) -> i64 {
    sign_ext(((h >> 7) & 0x20) | ((h >> 2) & 0x1f), 6)
}

fn c_shamt(h: u32) -> i64 {
    (((h >> 7) & 0x20) | ((h >> 2) & 0x1f)) as i64
}

fn c_addi4spn_imm(h: u32) -> i64 {
    (((h >> 7) & 0x30) | ((h >> 1) & 0x3c0) | ((h >> 4) & 0x4) | ((h >> 2) & 0x8))
        as i64
}

fn c_addi16sp_imm(h: u32) -> i64 {
    let raw = ((h >> 3) & 0x200)
        | ((h >> 2) & 0x10)
        | ((h << 1) & 0x40)
        | ((h << 4) & 0x180)
        | ((h << 3) & 0x20);
    sign_ext(raw, 10)
}

fn c_j_off(h: u32) -> i64 {
    let raw = ((h >> 1) & 0x800)
        | ((h >> 7) & 0x10)
        | ((h >> 1) & 0x300)
        | ((h << 2) & 0x400)
        | ((h >> 1) & 0x40)
        | ((h << 1) & 0x80)
        | ((h >> 2) & 0xe)
        | ((h << 3) & 0x20);
    sign_ext(raw, 12)
}

fn c_b_off(h: u32) -> i64 {
    let raw = ((h >> 4) & 0x100)
        | ((h >> 7) & 0x18)
        | ((h << 1) & 0xc0)
        | ((h >> 2) & 0x6)
        | ((h << 3) & 0x20);
    sign_ext(raw, 9)
}

fn c_lw_off(h: u32) -> i64 {
    (((h >> 7) & 0x38) | ((h >> 4) & 0x4) | ((h << 1) & 0x40)) as i64
}

fn c_ld_off(h: u32) -> i64 {
    (((h >> 7) & 0x38) | ((h << 1) & 0xc0)) as i64
}

fn c_lwsp_off(h: u32) -> i64 {
    (((h >> 2) & 0x1c) | ((h >> 7) & 0x20) | ((h << 4) & 0xc0)) as i64
}

fn c_ldsp_off(h: u32) -> i64 {
    (((h >> 2) & 0x18) | ((h >> 7) & 0x20) | ((h << 4) & 0x1c0)) as i64
}

fn c_swsp_off(h: u32) -> i64 {
    (((h >> 7) & 0x3c) | ((h >> 1) & 0xc0)) as i64
}

fn c_sdsp_off(h: u32) -> i64 {
    (((h >> 7) & 0x38) | ((h >> 1) & 0x1c0)) as i64
}

fn decode16(h: u32) -> Option<Insn> {
    use Op::*;
    let f3 = (h >> 13) & 0x7;
    let rd = (h >> 7) & 0x1f;
    let rs2 = (h >> 2) & 0x1f;
    let rd_c = creg(h >> 2);
    let rs1_c = creg(h >> 7);

    let insn = match (h & 0x3, f3) {
        // Quadrant 0
        (0, 0) => {
            let imm = c_addi4spn_imm(h);
            if imm == 0 {
                return None;
            }
            Insn::new(Addi, rd_c, 2, 0, imm)
        }
        (0, 2) => Insn::new(Lw, rd_c, rs1_c, 0, c_lw_off(h)),
        (0, 3) => Insn::new(Ld, rd_c, rs1_c, 0, c_ld_off(h)),
        (0, 6) => Insn::new(Sw, 0, rs1_c, rd_c, c_lw_off(h)),
        (0, 7) => Insn::new(Sd, 0, rs1_c, rd_c, c_ld_off(h)),

        // Quadrant 1
        (1, 0) => Insn::new(Addi, rd, rd, 0, c_imm6(h)),
        (1, 1) if rd != 0 => Insn::new(Addiw, rd, rd, 0, c_imm6(h)),
        (1, 2) => Insn::new(Addi, rd, 0, 0, c_imm6(h)),
        (1, 3) if rd == 2 => {
            let imm = c_addi16sp_imm(h);
            if imm == 0 {
                return None;
            }
            Insn::new(Addi, 2, 2, 0, imm)
        }
        (1, 3) => {
            let imm = c_imm6(h);
            if imm == 0 || rd == 0 {
                return None;
            }
            Insn::new(Lui, rd, 0, 0, imm << 12)
        }
        (1, 4) => {
            let rd = rs1_c;
            match (h >> 10) & 0x3 {
                0 => Insn::new(Srli, rd, rd, 0, c_shamt(h)),
                1 => Insn::new(Srai, rd, rd, 0, c_shamt(h)),
                2 => Insn::new(Andi, rd, rd, 0, c_imm6(h)),
                _ => {
                    let op = match ((h >> 12) & 1, (h >> 5) & 0x3) {
                        (0, 0) => Sub,
                        (0, 1) => Xor,
                        (0, 2) => Or,
                        (0, 3) => And,
                        (1, 0) => Subw,
                        (1, 1) => Addw,
                        _ => return None,
                    };
                    Insn::new(op, rd, rd, rd_c, 0)
                }
            }
        }
        (1, 5) => Insn::new(Jal, 0, 0, 0, c_j_off(h)),
        (1, 6) => Insn::new(Beq, 0, rs1_c, 0, c_b_off(h)),
        (1, 7) => Insn::new(Bne, 0, rs1_c, 0, c_b_off(h)),

        // Quadrant 2
        (2, 0) => Insn::new(Slli, rd, rd, 0, c_shamt(h)),
        (2, 2) if rd != 0 => Insn::new(Lw, rd, 2, 0, c_lwsp_off(h)),
        (2, 3) if rd != 0 => Insn::new(Ld, rd, 2, 0, c_ldsp_off(h)),
        (2, 4) => match ((h >> 12) & 1, rd, rs2) {
            (0, 0, 0) => return None,
            (0, _, 0) => Insn::new(Jalr, 0, rd, 0, 0),
            (0, _, _) => Insn::new(Add, rd, 0, rs2, 0),
            (1, 0, 0) => Insn::new(Ebreak, 0, 0, 0, 0),
            (1, _, 0) => Insn::new(Jalr, 1, rd, 0, 0),
            _ => Insn::new(Add, rd, rd, rs2, 0),
        },
        (2, 6) => Insn::new(Sw, 0, 2, rs2, c_swsp_off(h)),
        (2, 7) => Insn::new(Sd, 0, 2, rs2, c_sdsp_off(h)),
        _ => return None,
    };
    Some(insn)
}

// ================================================================
// Disassembly
// ================================================================

const REG_ABI: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1",
    "a2", "a3", "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

fn reg(r: u8) -> &'static str {
    REG_ABI[(r & 0x1f) as usize]
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Op::*;
        let mn = self.op.mnemonic();
        let (rd, rs1, rs2, imm) =
            (reg(self.rd), reg(self.rs1), reg(self.rs2), self.imm);
        match self.op {
            Lui | Auipc => write!(f, "{mn} {rd}, {:#x}", (imm >> 12) & 0xfffff),
            Jal => write!(f, "{mn} {rd}, {imm}"),
            Jalr => write!(f, "{mn} {rd}, {imm}({rs1})"),
            _ if self.is_cond_branch() => write!(f, "{mn} {rs1}, {rs2}, {imm}"),
            _ if self.is_load() => write!(f, "{mn} {rd}, {imm}({rs1})"),
            _ if self.is_store() => write!(f, "{mn} {rs2}, {imm}({rs1})"),
            Addi | Slti | Sltiu | Xori | Ori | Andi | Slli | Srli | Srai
            | Addiw | Slliw | Srliw | Sraiw => {
                write!(f, "{mn} {rd}, {rs1}, {imm}")
            }
            Csrrw | Csrrs | Csrrc => write!(f, "{mn} {rd}, {imm:#x}, {rs1}"),
            Csrrwi | Csrrsi | Csrrci => {
                write!(f, "{mn} {rd}, {imm:#x}, {}", self.rs1)
            }
            Fence | FenceI | Ecall | Ebreak | Mret | Wfi => f.write_str(mn),
            _ => write!(f, "{mn} {rd}, {rs1}, {rs2}"),
        }
    }
}
