//! RISC-V frontend: RV64I, Zicsr and the common C subset, machine
//! mode only.

pub mod cpu;
pub mod exec;
pub mod insn;
pub mod trap;

pub use cpu::{InterruptLine, RiscvCpu};
pub use exec::{execute, Flow};
pub use insn::{decode, insn_len, Insn, InsnClass, Op};
pub use trap::{MachineTrapHandler, TrapAction, TrapHandler};
