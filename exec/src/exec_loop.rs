use std::sync::Arc;

use crossbeam_channel::Sender;
use tcg_backend::{BlockEntry, Helpers, HostCodeGen};
use tcg_core::{
    invariant, page_base, page_offset, pfn, AccessKind, AddressTranslator,
    CompiledBlock, ExitKind, GuestFault, Trap, PAGE_SIZE,
};
use tcg_frontend::riscv::{
    decode, execute, insn_len, RiscvCpu, TrapAction, TrapHandler,
};
use tcg_frontend::Bus;

use crate::compile_queue::{CompileTask, Enqueue};
use crate::page_version::PageState;
use crate::smc::{guest_store, leave_smc_page};
use crate::stats::ExecStats;
use crate::{ExecEnv, PerCpuState, SharedState};

/// Reason the execution loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The trap handler asked to stop after this trap.
    Halted(Trap),
    /// The block budget passed to [`cpu_exec_loop`] is spent.
    BlockLimit,
}

/// Result of running one block, compiled or interpreted.
enum Step {
    /// Continue at `cpu.pc`; carries its PA when already known.
    Continue(Option<u64>),
    /// Take this exception at `cpu.pc`.
    Fault(GuestFault),
}

/// Data port for one block: translates, reads RAM, and sends
/// stores through the invalidation hook.
struct MemPort<'a, B, T: ?Sized> {
    shared: &'a SharedState<B>,
    mmu: &'a T,
    /// Frame the running block is fetched from.
    fetch_pfn: u64,
    /// Frames the running compiled block was built from.
    code_pages: [Option<u64>; 2],
    exit: bool,
}

impl<'a, B, T> MemPort<'a, B, T>
where
    T: AddressTranslator + ?Sized,
{
    fn new(shared: &'a SharedState<B>, mmu: &'a T, fetch_pfn: u64) -> Self {
        Self {
            shared,
            mmu,
            fetch_pfn,
            code_pages: [None, None],
            exit: false,
        }
    }
}

impl<B, T> Bus for MemPort<'_, B, T>
where
    T: AddressTranslator + ?Sized,
{
    fn load(&mut self, va: u64, size: u8) -> Result<u64, GuestFault> {
        let pa = self.mmu.translate(va, AccessKind::Load)?;
        let mut buf = [0u8; 8];
        self.shared
            .mem
            .read(pa, &mut buf[..size as usize])
            .map_err(|_| GuestFault::LoadAccessFault(va))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, va: u64, size: u8, val: u64) -> Result<(), GuestFault> {
        let pa = self.mmu.translate(va, AccessKind::Store)?;
        let bytes = val.to_le_bytes();
        let out = guest_store(
            self.shared,
            pa,
            &bytes[..size as usize],
            Some(self.fetch_pfn),
        )
        .map_err(|_| GuestFault::StoreAccessFault(va))?;
        if out.same_page || self.code_pages.contains(&Some(pfn(pa))) {
            self.exit = true;
        }
        Ok(())
    }
}

impl<B, T> Helpers for MemPort<'_, B, T>
where
    T: AddressTranslator + ?Sized,
{
    fn check_interrupts(&mut self, cpu: &RiscvCpu) -> bool {
        cpu.pending_interrupt().is_some()
    }

    fn exit_requested(&self) -> bool {
        self.exit
    }
}

/// Main CPU execution loop.
///
/// Each iteration translates `cpu.pc`, then either runs the
/// compiled block for that PA or interprets one basic block from it,
/// and finally polls for interrupts, also after a fetch fault.
/// Exceptions and interrupts go to `traps`; the loop returns when it
/// says [`TrapAction::Halt`] or after `limit` blocks.
pub fn cpu_exec_loop<B, T, H>(
    env: &mut ExecEnv<B>,
    cpu: &mut RiscvCpu,
    mmu: &T,
    traps: &mut H,
    limit: Option<u64>,
) -> ExitReason
where
    B: HostCodeGen + 'static,
    T: AddressTranslator + ?Sized,
    H: TrapHandler + ?Sized,
{
    let shared = Arc::clone(env.shared());
    let mut chain: Option<u64> = None;
    let mut blocks = 0u64;

    loop {
        if limit.is_some_and(|l| blocks >= l) {
            return ExitReason::BlockLimit;
        }
        env.sync_jump_cache();

        let pc = cpu.pc;
        let fetch = match chain.take() {
            Some(pa) => {
                env.per_cpu.stats.chained += 1;
                Ok(pa)
            }
            None if pc & 1 != 0 => Err(GuestFault::InstructionMisaligned(pc)),
            None => mmu.translate(pc, AccessKind::Fetch).map_err(GuestFault::from),
        };
        let step = match fetch {
            Ok(pa) => dispatch(env, &shared, cpu, mmu, pc, pa),
            Err(fault) => Step::Fault(fault),
        };
        blocks += 1;

        match step {
            Step::Continue(next) => chain = next,
            Step::Fault(fault) => {
                env.per_cpu.stats.exceptions += 1;
                if let Some(r) = raise(cpu, traps, Trap::Exception(fault)) {
                    return r;
                }
            }
        }

        if let Some(code) = cpu.pending_interrupt() {
            chain = None;
            env.per_cpu.stats.interrupts += 1;
            if let Some(r) = raise(cpu, traps, Trap::Interrupt(code)) {
                return r;
            }
        }
    }
}

/// Run one block at `pa`: forced interpretation on an SMC page,
/// the compiled block when one is usable, otherwise count the miss
/// and interpret.
fn dispatch<B, T>(
    env: &mut ExecEnv<B>,
    shared: &SharedState<B>,
    cpu: &mut RiscvCpu,
    mmu: &T,
    pc: u64,
    pa: u64,
) -> Step
where
    B: HostCodeGen + 'static,
    T: AddressTranslator + ?Sized,
{
    let frame = pfn(pa);
    let pages = shared.cache.pages();
    if let Some(prev) = env.per_cpu.fetch_pfn {
        if prev != frame && pages.state(prev) == PageState::SmcDetected {
            leave_smc_page(shared, prev);
        }
    }
    env.per_cpu.fetch_pfn = Some(frame);

    if pages.state(frame) == PageState::SmcDetected {
        env.per_cpu.stats.forced_interp += 1;
        return interpret(shared, &mut env.per_cpu.stats, cpu, mmu, pa);
    }
    if let Some(block) = find_block(shared, &mut env.per_cpu, mmu, pc, pa) {
        return run_block(shared, &mut env.per_cpu.stats, cpu, mmu, &block, pa);
    }
    let count = shared.cache.hotness().increment(pa);
    if shared.cache.hotness().is_hot(count) {
        request_compile(shared, env.tx.as_ref(), &mut env.per_cpu.stats, mmu, pc, pa);
    }
    interpret(shared, &mut env.per_cpu.stats, cpu, mmu, pa)
}

fn raise<H: TrapHandler + ?Sized>(
    cpu: &mut RiscvCpu,
    traps: &mut H,
    trap: Trap,
) -> Option<ExitReason> {
    log::trace!("[tcg-exec] trap {trap:?} at {:#x}", cpu.pc);
    match traps.handle(cpu, trap) {
        TrapAction::Resume => None,
        TrapAction::Halt => Some(ExitReason::Halted(trap)),
    }
}

/// Find a usable compiled block for `pa`: jump cache first, then
/// the shared map. A block spanning two pages is only used when the
/// next virtual page still maps to the frame it was built from.
fn find_block<B, T>(
    shared: &SharedState<B>,
    per_cpu: &mut PerCpuState,
    mmu: &T,
    pc: u64,
    pa: u64,
) -> Option<Arc<CompiledBlock>>
where
    T: AddressTranslator + ?Sized,
{
    let block = match per_cpu.jump_cache.lookup(pa) {
        Some(b) => {
            per_cpu.stats.jump_cache_hits += 1;
            b
        }
        None => {
            let b = shared.cache.lookup(pa)?;
            per_cpu.jump_cache.insert(&b);
            b
        }
    };

    let pages = shared.cache.pages();
    let first = block.stamp.first();
    // Version before validity: a store marks blocks dead before it
    // moves the version.
    let live = pages.version(first.pfn);
    if !block.is_valid() {
        return None;
    }
    if !invariant!(
        live == first.version,
        "block {pa:#x} stamped v{} but frame {:#x} is at v{live}",
        first.version,
        first.pfn
    ) {
        return None;
    }

    if let Some(second) = block.stamp.second() {
        let next_va = page_base(pc).wrapping_add(PAGE_SIZE);
        match mmu.translate(next_va, AccessKind::Fetch) {
            Ok(pa2)
                if pfn(pa2) == second.pfn
                    && pages.version(second.pfn) == second.version => {}
            _ => return None,
        }
    }
    Some(block)
}

fn run_block<B, T>(
    shared: &SharedState<B>,
    stats: &mut ExecStats,
    cpu: &mut RiscvCpu,
    mmu: &T,
    block: &CompiledBlock,
    pa: u64,
) -> Step
where
    B: HostCodeGen,
    T: AddressTranslator + ?Sized,
{
    shared.cache.touch(block);
    let entry = BlockEntry { pc: cpu.pc, pa };
    let mut port = MemPort::new(shared, mmu, pfn(pa));
    port.code_pages = [
        Some(block.stamp.first().pfn),
        block.stamp.second().map(|p| p.pfn),
    ];

    let code = shared.cache.code(block);
    let exit = shared.backend.execute(code, entry, cpu, &mut port);
    cpu.pc = exit.next_pc;
    stats.compiled_blocks += 1;
    stats.compiled_insns += exit.insns;
    log::trace!(
        "[tcg-exec] ran {pa:#x}: {} insns, {:?} -> {:#x}",
        exit.insns,
        exit.kind,
        exit.next_pc
    );

    match exit.kind {
        ExitKind::Fallthrough => Step::Continue(exit.chain_pa),
        ExitKind::Exception(fault) => Step::Fault(fault),
        ExitKind::Interrupt | ExitKind::ToInterpreter => Step::Continue(None),
    }
}

/// Interpret one basic block starting at `cpu.pc` (physical `pa`).
///
/// Stops after a control-flow or serializing instruction, on an
/// exception, when the next instruction starts on another frame, or
/// at the instruction cap. A 32-bit instruction whose upper half is
/// on the next page has that page translated first; if it is not
/// executable the block ends before the instruction, and the fault
/// is raised when the instruction is next dispatched.
fn interpret<B, T>(
    shared: &SharedState<B>,
    stats: &mut ExecStats,
    cpu: &mut RiscvCpu,
    mmu: &T,
    pa: u64,
) -> Step
where
    T: AddressTranslator + ?Sized,
{
    let frame = pfn(pa);
    let max = shared.config.max_block_insns;
    let mut port = MemPort::new(shared, mmu, frame);
    let mut pc = cpu.pc;
    let mut cur = pa;
    let mut n = 0u32;

    let step = loop {
        let mut raw = [0u8; 4];
        if shared.mem.read(cur, &mut raw[..2]).is_err() {
            break Step::Fault(GuestFault::InstructionAccessFault(pc));
        }
        let len = insn_len(u16::from_le_bytes([raw[0], raw[1]]));
        let crosses = len == 4 && page_offset(cur) == PAGE_SIZE - 2;
        if len == 4 {
            let hi = if crosses {
                match mmu.translate(pc.wrapping_add(2), AccessKind::Fetch) {
                    Ok(hi) => hi,
                    Err(_) if n > 0 => break Step::Continue(None),
                    Err(pf) => break Step::Fault(pf.into()),
                }
            } else {
                cur + 2
            };
            if shared.mem.read(hi, &mut raw[2..]).is_err() {
                break Step::Fault(GuestFault::InstructionAccessFault(pc));
            }
        }

        let insn = match decode(&raw[..len]) {
            Ok(insn) => insn,
            Err(fault) => break Step::Fault(fault),
        };
        let flow = match execute(cpu, &insn, pc, &mut port) {
            Ok(flow) => flow,
            Err(fault) => break Step::Fault(fault),
        };
        n += 1;
        let next = flow.next_pc(pc, insn.len);
        cpu.pc = next;

        if insn.ends_block() || crosses || n >= max {
            break Step::Continue(None);
        }
        pc = next;
        cur += len as u64;
        if pfn(cur) != frame {
            break Step::Continue(None);
        }
    };

    stats.interp_blocks += 1;
    stats.interp_insns += n as u64;
    log::trace!("[tcg-exec] interpreted {pa:#x}: {n} insns");
    step
}

fn request_compile<B, T>(
    shared: &SharedState<B>,
    tx: Option<&Sender<CompileTask>>,
    stats: &mut ExecStats,
    mmu: &T,
    pc: u64,
    pa: u64,
) where
    T: AddressTranslator + ?Sized,
{
    let Some(tx) = tx else {
        return;
    };
    if shared.queue.in_flight(pa) {
        return;
    }
    let next_va = page_base(pc).wrapping_add(PAGE_SIZE);
    let task = CompileTask {
        entry_pa: pa,
        entry_va: pc,
        next_page_pa: mmu.translate(next_va, AccessKind::Fetch).ok(),
    };
    match shared.queue.request(tx, task) {
        Enqueue::Sent => {
            stats.compile_requests += 1;
            log::trace!("[tcg-exec] queued {pa:#x} for compilation");
        }
        Enqueue::InFlight => {}
        Enqueue::Full => {
            stats.compile_dropped += 1;
            log::debug!("[tcg-exec] compile queue full, dropped {pa:#x}");
        }
    }
}
