//! TCG backend: host code emission and execution.
//!
//! The compile worker drives a [`HostCodeGen`] to turn one decoded
//! basic block into host code in a private [`CodeBuffer`]; the
//! commit step copies the bytes into the shared [`CodeArena`] at an
//! extent handed out by [`ArenaAllocator`]. The execution loop later
//! runs them through [`HostCodeGen::execute`].
//!
//! # Calling convention
//!
//! Compiled code is entered with exactly three live values, which
//! stay pinned for the whole block:
//!
//! | value        | meaning                                         |
//! |--------------|-------------------------------------------------|
//! | `cpu`        | `&mut RiscvCpu`; the only guest register file   |
//! | `helpers`    | `&mut dyn Helpers`; every runtime call goes here |
//! | `entry`      | [`BlockEntry`]: VA and PA the block was entered at |
//!
//! Guest state is never cached across a helper call: a helper may
//! read or write any field of `cpu`. Every helper returns either a
//! value or a sentinel meaning "leave compiled code now"
//! ([`Helpers::check_interrupts`] returning `true`,
//! [`Helpers::exit_requested`] after a store). Every exit path
//! writes `cpu.pc` and returns a [`BlockExit`] by value.

pub mod arena;
pub mod code_buffer;
pub mod threaded;

pub use arena::{ArenaAllocator, CodeArena, ARENA_ALIGN};
pub use code_buffer::CodeBuffer;
pub use threaded::ThreadedCodeGen;

use tcg_core::BlockExit;
use tcg_frontend::riscv::{Insn, RiscvCpu};
use tcg_frontend::Bus;

/// Runtime helpers callable from compiled code.
///
/// Loads and stores come from [`Bus`]; a store that lands on a page
/// the running block was built from must make
/// [`exit_requested`](Helpers::exit_requested) return `true`.
pub trait Helpers: Bus {
    /// Safepoint helper. `cpu.pc` already holds the next guest
    /// instruction. Returns `true` when an interrupt is pending and
    /// compiled code must exit.
    fn check_interrupts(&mut self, cpu: &RiscvCpu) -> bool;

    /// Sentinel polled after each store: the block's own code was
    /// invalidated and must not continue.
    fn exit_requested(&self) -> bool;
}

/// Where a block is being entered. Compiled code is position
/// independent in the guest: PCs are offsets from `pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Guest VA of the first instruction.
    pub pc: u64,
    /// Guest PA of the first instruction.
    pub pa: u64,
}

/// Position of an emitted safepoint, usable as a loop target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) usize);

/// Per-compilation emitter state: the private scratch buffer plus
/// the guest PC the block starts at.
#[derive(Debug, Default)]
pub struct EmitContext {
    pub buf: CodeBuffer,
    pub entry_pc: u64,
}

impl EmitContext {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::with_default_size(),
            entry_pc: 0,
        }
    }

    /// Offset of `pc` from the block entry.
    #[inline]
    pub fn pc_off(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.entry_pc)
    }
}

/// Trait for host code generators.
///
/// Emission is pure: it writes only to the caller's context and
/// never touches shared state, so it runs with no locks held.
pub trait HostCodeGen: Send + Sync {
    /// Start a block whose first instruction is at `entry_pc`.
    fn begin(&self, ctx: &mut EmitContext, entry_pc: u64);

    /// Emit one guest instruction located at `pc`.
    fn emit_insn(&self, ctx: &mut EmitContext, insn: &Insn, pc: u64);

    /// Emit a safepoint before the instruction at `pc`. The returned
    /// label marks it as a loop header.
    fn emit_safepoint(&self, ctx: &mut EmitContext, pc: u64) -> Label;

    /// Emit a backward same-page branch whose taken arm jumps to the
    /// safepoint at `header` instead of leaving the block.
    fn emit_loop_branch(
        &self,
        ctx: &mut EmitContext,
        insn: &Insn,
        pc: u64,
        header: Label,
    );

    /// Close the block: control that falls off the end continues at
    /// `next_pc`.
    fn finish(&self, ctx: &mut EmitContext, next_pc: u64);

    /// Run code produced by this generator.
    fn execute(
        &self,
        code: &[u8],
        entry: BlockEntry,
        cpu: &mut RiscvCpu,
        helpers: &mut dyn Helpers,
    ) -> BlockExit;
}
