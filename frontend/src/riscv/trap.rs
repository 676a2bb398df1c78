//! Trap entry.

use tcg_core::Trap;

use super::cpu::{RiscvCpu, MSTATUS_MIE, MSTATUS_MPIE};

/// What the execution loop does after a trap was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapAction {
    /// Continue dispatching from `cpu.pc`.
    Resume,
    /// Leave the execution loop.
    Halt,
}

/// Trap-handling collaborator of the execution loop.
///
/// Called with `cpu.pc` at the faulting instruction (exceptions)
/// or at the first instruction not yet executed (interrupts).
pub trait TrapHandler {
    fn handle(&mut self, cpu: &mut RiscvCpu, trap: Trap) -> TrapAction;
}

impl<F> TrapHandler for F
where
    F: FnMut(&mut RiscvCpu, Trap) -> TrapAction,
{
    fn handle(&mut self, cpu: &mut RiscvCpu, trap: Trap) -> TrapAction {
        self(cpu, trap)
    }
}

/// Architectural machine-mode trap entry.
///
/// A CPU with `mtvec == 0` has no handler installed; the trap is
/// reported to the embedder by halting instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineTrapHandler;

impl TrapHandler for MachineTrapHandler {
    fn handle(&mut self, cpu: &mut RiscvCpu, trap: Trap) -> TrapAction {
        if cpu.mtvec == 0 {
            return TrapAction::Halt;
        }
        let (cause, tval) = match trap {
            Trap::Exception(f) => (f.cause(), f.tval()),
            Trap::Interrupt(code) => ((1 << 63) | code, 0),
        };
        cpu.mepc = cpu.pc;
        cpu.mcause = cause;
        cpu.mtval = tval;
        if cpu.mstatus & MSTATUS_MIE != 0 {
            cpu.mstatus |= MSTATUS_MPIE;
        } else {
            cpu.mstatus &= !MSTATUS_MPIE;
        }
        cpu.mstatus &= !MSTATUS_MIE;
        cpu.pc = cpu.mtvec;
        TrapAction::Resume
    }
}
