//! Portable threaded-code backend.
//!
//! Host code is a list of [`Uop`] records. Executing a block walks
//! the list and calls the frontend semantics for each guest
//! instruction, so it runs on any host and shares every instruction
//! definition with the interpreter. What it buys over interpretation
//! is the skipped fetch, decode and per-instruction dispatch checks.

pub mod uop;

use tcg_core::{invariant, page_base, page_offset, BlockExit};
use tcg_frontend::riscv::{execute, Flow, InsnClass, Insn, RiscvCpu};

use crate::{BlockEntry, EmitContext, Helpers, HostCodeGen, Label};
pub use uop::{Uop, UopKind, UOP_SIZE};

/// Threaded-code generator.
#[derive(Debug, Clone)]
pub struct ThreadedCodeGen {
    /// Instructions retired between two interrupt polls.
    safepoint_interval: u32,
}

impl ThreadedCodeGen {
    pub fn new(safepoint_interval: u32) -> Self {
        Self {
            safepoint_interval: safepoint_interval.max(1),
        }
    }

    pub fn safepoint_interval(&self) -> u32 {
        self.safepoint_interval
    }

    fn record_index(ctx: &EmitContext) -> usize {
        ctx.buf.offset() / UOP_SIZE
    }

    fn pc_off(ctx: &EmitContext, pc: u64) -> u16 {
        let off = ctx.pc_off(pc);
        debug_assert!(off <= u16::MAX as u64, "block spans {off:#x} bytes");
        off as u16
    }
}

impl Default for ThreadedCodeGen {
    fn default() -> Self {
        Self::new(65536)
    }
}

/// PA of `target` when it lies on the entry page, so the dispatcher
/// can skip translation.
fn chain_pa(entry: BlockEntry, target: u64) -> Option<u64> {
    (page_base(target) == page_base(entry.pc))
        .then(|| page_base(entry.pa) | page_offset(target))
}

impl HostCodeGen for ThreadedCodeGen {
    fn begin(&self, ctx: &mut EmitContext, entry_pc: u64) {
        ctx.buf.clear();
        ctx.entry_pc = entry_pc;
    }

    fn emit_insn(&self, ctx: &mut EmitContext, insn: &Insn, pc: u64) {
        let off = Self::pc_off(ctx, pc);
        Uop::from_insn(UopKind::Insn, insn, off, 0).encode(&mut ctx.buf);
    }

    fn emit_safepoint(&self, ctx: &mut EmitContext, pc: u64) -> Label {
        let label = Label(Self::record_index(ctx));
        let off = Self::pc_off(ctx, pc);
        let interval = self.safepoint_interval.min(i32::MAX as u32) as i32;
        Uop::control(UopKind::Safepoint, off, interval, 0).encode(&mut ctx.buf);
        label
    }

    fn emit_loop_branch(
        &self,
        ctx: &mut EmitContext,
        insn: &Insn,
        pc: u64,
        header: Label,
    ) {
        let off = Self::pc_off(ctx, pc);
        Uop::from_insn(UopKind::LoopBranch, insn, off, header.0 as u16)
            .encode(&mut ctx.buf);
    }

    fn finish(&self, ctx: &mut EmitContext, next_pc: u64) {
        let off = Self::pc_off(ctx, next_pc);
        Uop::control(UopKind::Exit, off, 0, 0).encode(&mut ctx.buf);
    }

    fn execute(
        &self,
        code: &[u8],
        entry: BlockEntry,
        cpu: &mut RiscvCpu,
        helpers: &mut dyn Helpers,
    ) -> BlockExit {
        let mut idx = 0usize;
        let mut insns = 0u64;
        let mut since_poll = 0u64;
        let mut next_pc = entry.pc;

        loop {
            let Some(uop) = Uop::decode(code, idx) else {
                invariant!(false, "malformed threaded code at record {idx}");
                cpu.pc = next_pc;
                return BlockExit::to_interpreter(next_pc, insns);
            };
            let pc = entry.pc.wrapping_add(uop.pc_off as u64);

            match uop.kind {
                UopKind::Safepoint => {
                    if since_poll >= uop.imm as u64 {
                        since_poll = 0;
                        cpu.pc = pc;
                        if helpers.check_interrupts(cpu) {
                            return BlockExit::interrupt(pc, insns);
                        }
                    }
                    idx += 1;
                }
                UopKind::Insn | UopKind::LoopBranch => {
                    let Some(insn) = uop.insn() else {
                        invariant!(false, "bad opcode {} at record {idx}", uop.op);
                        cpu.pc = pc;
                        return BlockExit::to_interpreter(pc, insns);
                    };
                    let flow = match execute(cpu, &insn, pc, &mut *helpers) {
                        Ok(flow) => flow,
                        Err(fault) => {
                            cpu.pc = pc;
                            return BlockExit::exception(pc, fault, insns);
                        }
                    };
                    insns += 1;
                    since_poll += 1;
                    next_pc = flow.next_pc(pc, insn.len);

                    if helpers.exit_requested() {
                        cpu.pc = next_pc;
                        return BlockExit::to_interpreter(next_pc, insns);
                    }
                    match flow {
                        Flow::Jump(_) if uop.kind == UopKind::LoopBranch => {
                            idx = uop.aux as usize;
                        }
                        Flow::Jump(target) => {
                            cpu.pc = target;
                            let chain = (insn.class() == InsnClass::DirectBranch)
                                .then(|| chain_pa(entry, target))
                                .flatten();
                            return BlockExit::fallthrough(target, chain, insns);
                        }
                        Flow::Next => idx += 1,
                    }
                }
                UopKind::Exit => {
                    cpu.pc = pc;
                    return BlockExit::fallthrough(pc, chain_pa(entry, pc), insns);
                }
            }
        }
    }
}
