//! Integration tests for the tcg-exec engine: worker phases and the
//! execution loop on small guest programs.

mod cache;
mod stress;

use std::sync::Arc;
use std::thread;

use tcg_core::{
    pfn, AccessKind, AddressTranslator, BareTranslator, BlockEnd,
    CompileAbort, ConfigError, GuestFault, GuestRam, PageFault, PageStamp,
    PhysMemory, TcgConfig, TcgError, Trap, ValidityStamp,
};
use tcg_exec::worker::{commit, compile, process, snapshot};
use tcg_exec::{
    cpu_exec_loop, CompilationSnapshot, CompileTask, ExecEnv, ExitReason,
};
use tcg_frontend::riscv::cpu::{IRQ_M_TIMER, MSTATUS_MIE};
use tcg_frontend::riscv::{MachineTrapHandler, RiscvCpu, TrapAction};

use crate::rv::*;

fn task(pa: u64) -> CompileTask {
    CompileTask {
        entry_pa: pa,
        entry_va: pa,
        next_page_pa: None,
    }
}

/// Identity translation with one frame not executable.
struct NoExecPage(u64);

impl AddressTranslator for NoExecPage {
    fn translate(&self, va: u64, kind: AccessKind) -> Result<u64, PageFault> {
        if matches!(kind, AccessKind::Fetch) && pfn(va) == self.0 {
            return Err(PageFault::new(va, kind));
        }
        Ok(va)
    }
}

fn ecall_halt() -> ExitReason {
    ExitReason::Halted(Trap::Exception(GuestFault::EnvironmentCall))
}

// ── Worker phases ─────────────────────────────────────────────

#[test]
fn test_snapshot_copies_to_page_end() {
    let m = Machine::new(test_config());
    let shared = m.env.shared();

    let snap = snapshot(shared, &task(0x1ff8)).unwrap();
    assert_eq!(snap.bytes.len(), 8);
    assert!(!snap.stamp.spans_two_pages());

    let with_next = CompileTask {
        next_page_pa: Some(0x2000),
        ..task(0x1ff8)
    };
    let snap = snapshot(shared, &with_next).unwrap();
    assert_eq!(snap.bytes.len(), 10);
    assert_eq!(snap.stamp.second().map(|s| s.pfn), Some(2));
}

#[test]
fn test_compile_straight_block() {
    let m = Machine::new(test_config());
    m.load(0x2000, &[addi(1, 0, 1), addi(2, 1, 1), ECALL]);
    let shared = m.env.shared();

    let snap = snapshot(shared, &task(0x2000)).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    assert_eq!(code.insn_count, 3);
    assert_eq!(code.guest_len, 12);
    assert_eq!(code.end, BlockEnd::Trap);
    assert!(!code.has_loop);
    assert!(!code.stamp.spans_two_pages());
}

#[test]
fn test_compile_detects_loop() {
    let m = Machine::new(test_config());
    m.load(0x1000, &[addi(1, 1, 1), bne(1, 2, -4)]);
    let shared = m.env.shared();

    let snap = snapshot(shared, &task(0x1000)).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    assert_eq!(code.insn_count, 2);
    assert_eq!(code.end, BlockEnd::DirectBranch);
    assert!(code.has_loop);
}

#[test]
fn test_compile_limits() {
    let m = Machine::new(test_config());
    m.load(0x3000, &[addi(1, 1, 1); 10]);
    m.load(0x4ff0, &[addi(1, 1, 1); 4]);
    let shared = m.env.shared();

    let capped = TcgConfig {
        max_block_insns: 3,
        ..shared.config.clone()
    };
    let snap = snapshot(shared, &task(0x3000)).unwrap();
    let code = compile(&shared.backend, &capped, &snap).unwrap();
    assert_eq!((code.insn_count, code.guest_len), (3, 12));
    assert_eq!(code.end, BlockEnd::InsnLimit);

    let snap = snapshot(shared, &task(0x4ff0)).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    assert_eq!((code.insn_count, code.guest_len), (4, 16));
    assert_eq!(code.end, BlockEnd::PageBoundary);
}

#[test]
fn test_compile_emits_periodic_safepoints() {
    let m = Machine::new(test_config());
    m.load(0x3000, &[addi(1, 1, 1), addi(1, 1, 1), addi(1, 1, 1), ECALL]);
    let shared = m.env.shared();

    let short = TcgConfig {
        safepoint_interval: 2,
        ..shared.config.clone()
    };
    let snap = snapshot(shared, &task(0x3000)).unwrap();
    let code = compile(&shared.backend, &short, &snap).unwrap();
    // Four instructions, one safepoint before the third, and the exit.
    assert_eq!(code.code.len(), 6 * tcg_backend::threaded::UOP_SIZE);
}

#[test]
fn test_compile_crossing_instruction() {
    let m = Machine::new(test_config());
    m.load_parcels(0x5ffc, &[c_addi(1, 1)]);
    m.load(0x5ffe, &[addi(1, 1, 5)]);
    let shared = m.env.shared();

    // Without the next page the block stops before the crossing
    // instruction.
    let snap = snapshot(shared, &task(0x5ffc)).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    assert_eq!((code.insn_count, code.guest_len), (1, 2));
    assert!(!code.stamp.spans_two_pages());

    let with_next = CompileTask {
        next_page_pa: Some(0x6000),
        ..task(0x5ffc)
    };
    let snap = snapshot(shared, &with_next).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    assert_eq!((code.insn_count, code.guest_len), (2, 6));
    assert_eq!(code.end, BlockEnd::PageBoundary);
    assert_eq!(code.stamp.second().map(|s| s.pfn), Some(6));
}

#[test]
fn test_compile_rejects_empty_block() {
    let m = Machine::new(test_config());
    let shared = m.env.shared();
    let snap = snapshot(shared, &task(0x7000)).unwrap();
    let err = compile(&shared.backend, &shared.config, &snap).unwrap_err();
    assert_eq!(err, CompileAbort::Empty { pa: 0x7000 });
}

#[test]
fn test_duplicate_compile_aborts() {
    let m = Machine::new(test_config());
    m.load(0x2000, &[addi(1, 0, 1), ECALL]);
    let shared = m.env.shared();

    let snap = snapshot(shared, &task(0x2000)).unwrap();
    let code = compile(&shared.backend, &shared.config, &snap).unwrap();
    process(shared, task(0x2000)).unwrap();
    assert_eq!(
        commit(shared, code).unwrap_err(),
        CompileAbort::AlreadyInstalled { pa: 0x2000 }
    );
    assert_eq!(
        process(shared, task(0x2000)).unwrap_err(),
        CompileAbort::AlreadyInstalled { pa: 0x2000 }
    );
    assert_eq!(m.env.cache().stats_snapshot().duplicate_aborts, 1);
    assert_eq!(m.env.cache().len(), 1);
}

#[test]
fn test_concurrent_compiles_install_once() {
    let m = Machine::new(test_config());
    m.load(0x8000, &[addi(1, 1, 1), addi(2, 2, 1), ECALL]);
    let shared = m.env.shared();

    let installed: usize = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| s.spawn(|| process(shared, task(0x8000)).is_ok()))
            .collect();
        workers
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum()
    });
    assert_eq!(installed, 1);
    assert_eq!(m.env.cache().len(), 1);
}

// ── Execution loop ────────────────────────────────────────────

#[test]
fn test_interpret_until_ecall() {
    let mut m = Machine::new(test_config());
    m.load(0x1000, &[addi(1, 0, 5), addi(2, 1, 7), ECALL]);
    m.cpu.pc = 0x1000;

    assert_eq!(m.run(None), ecall_halt());
    assert_eq!(m.cpu.gpr[2], 12);
    assert_eq!(m.cpu.pc, 0x1008);
    let s = m.env.stats();
    assert_eq!((s.interp_blocks, s.interp_insns), (1, 2));
    assert_eq!(s.exceptions, 1);
    assert_eq!(s.compiled_blocks, 0);
}

#[test]
fn test_interpreted_block_stops_at_frame_end() {
    let mut m = Machine::new(test_config());
    m.load(0xff8, &[addi(1, 1, 1), addi(1, 1, 1), addi(1, 1, 1)]);
    m.cpu.pc = 0xff8;

    assert_eq!(m.run(Some(1)), ExitReason::BlockLimit);
    assert_eq!(m.cpu.pc, 0x1000);
    assert_eq!(m.env.stats().interp_insns, 2);
}

#[test]
fn test_hit_skips_hotness_and_chains() {
    let mut m = Machine::new(test_config());
    m.load(0xc000, &[addi(1, 1, 1), jal(0, 8)]);
    m.load(0xc00c, &[ECALL]);
    process(m.env.shared(), task(0xc000)).unwrap();
    process(m.env.shared(), task(0xc00c)).unwrap();
    m.cpu.mtvec = 0xc000;
    m.cpu.pc = 0xc000;

    assert_eq!(m.run(Some(20)), ExitReason::BlockLimit);
    assert_eq!(m.cpu.gpr[1], 10);
    assert_eq!(m.cpu.mcause, 11);

    let s = *m.env.stats();
    assert_eq!(s.compiled_blocks, 20);
    assert_eq!(s.interp_blocks, 0);
    assert_eq!(s.chained, 10);
    assert_eq!(s.jump_cache_hits, 18);
    assert_eq!(s.exceptions, 10);
    assert_eq!(m.env.cache().hotness().get(0xc000), 0);
    assert_eq!(m.env.cache().hotness().get(0xc00c), 0);
}

#[test]
fn test_compiled_self_store_leaves_block() {
    let mut m = Machine::new(test_config());
    m.load(
        0x7000,
        &[lui(5, 0x7000), addi(1, 1, 1), sw(0, 5, 0x100), addi(2, 2, 1), ECALL],
    );
    process(m.env.shared(), task(0x7000)).unwrap();
    m.cpu.pc = 0x7000;

    assert_eq!(m.run(None), ecall_halt());
    // Nothing before the store ran twice, nothing after it was
    // skipped.
    assert_eq!(m.cpu.gpr[1], 1);
    assert_eq!(m.cpu.gpr[2], 1);
    let s = m.env.stats();
    assert_eq!((s.compiled_blocks, s.compiled_insns), (1, 3));
    assert_eq!(s.forced_interp, 1);
    assert!(!m.env.cache().contains(0x7000));
}

#[test]
fn test_patched_code_never_runs_stale() {
    let mut m = Machine::new(test_config());
    m.load(0xa000, &[addi(1, 0, 1), ECALL]);
    process(m.env.shared(), task(0xa000)).unwrap();
    m.cpu.pc = 0xa000;
    assert_eq!(m.run(None), ecall_halt());
    assert_eq!(m.cpu.gpr[1], 1);

    let out = m.env.store(0xa000, &addi(1, 0, 2).to_le_bytes()).unwrap();
    assert_eq!(out.invalidated, 1);

    m.cpu.pc = 0xa000;
    assert_eq!(m.run(None), ecall_halt());
    assert_eq!(m.cpu.gpr[1], 2);
    assert_eq!(m.env.stats().compiled_blocks, 1);
}

#[test]
fn test_crossing_into_unmapped_page() {
    let mut m = Machine::new(test_config());
    m.load_parcels(0x8ffa, &[c_addi(1, 1), c_addi(1, 1)]);
    m.load(0x8ffe, &[addi(1, 1, 5)]);
    m.cpu.pc = 0x8ffa;
    let mmu = NoExecPage(9);

    // The block ends before the crossing instruction...
    let r = cpu_exec_loop(&mut m.env, &mut m.cpu, &mmu, &mut MachineTrapHandler, Some(1));
    assert_eq!(r, ExitReason::BlockLimit);
    assert_eq!(m.cpu.pc, 0x8ffe);
    assert_eq!(m.cpu.gpr[1], 2);

    // ...and the fault comes when it is dispatched on its own.
    let r = cpu_exec_loop(&mut m.env, &mut m.cpu, &mmu, &mut MachineTrapHandler, Some(1));
    assert_eq!(
        r,
        ExitReason::Halted(Trap::Exception(GuestFault::InstructionPageFault(0x9000)))
    );
    assert_eq!(m.cpu.pc, 0x8ffe);
    assert_eq!(m.cpu.gpr[1], 2);
}

#[test]
fn test_crossing_block_spans_two_frames() {
    let mut m = Machine::new(test_config());
    m.load_parcels(0x8ffa, &[c_addi(1, 1), c_addi(1, 1)]);
    m.load(0x8ffe, &[addi(1, 1, 5)]);

    m.cpu.pc = 0x8ffa;
    assert_eq!(m.run(Some(1)), ExitReason::BlockLimit);
    assert_eq!(m.cpu.gpr[1], 7);
    assert_eq!(m.cpu.pc, 0x9002);

    let t = CompileTask {
        next_page_pa: Some(0x9000),
        ..task(0x8ffa)
    };
    let block = process(m.env.shared(), t).unwrap();
    assert!(block.stamp.spans_two_pages());
    {
        let st = m.env.cache().lock();
        assert_eq!(st.blocks_in(8), &[0x8ffa]);
        assert_eq!(st.blocks_in(9), &[0x8ffa]);
    }

    m.cpu.pc = 0x8ffa;
    assert_eq!(m.run(Some(1)), ExitReason::BlockLimit);
    assert_eq!(m.cpu.gpr[1], 14);
    assert_eq!(m.env.stats().compiled_blocks, 1);

    // Not used while the second page is not executable.
    m.cpu.pc = 0x8ffa;
    let r = cpu_exec_loop(
        &mut m.env,
        &mut m.cpu,
        &NoExecPage(9),
        &mut MachineTrapHandler,
        Some(1),
    );
    assert_eq!(r, ExitReason::BlockLimit);
    assert_eq!(m.cpu.pc, 0x8ffe);
    assert_eq!(m.env.stats().compiled_blocks, 1);

    // A store to the second frame alone invalidates it.
    assert_eq!(m.env.store(0x9800, &[0; 4]).unwrap().invalidated, 1);
    assert!(!block.is_valid());
}

#[test]
fn test_invalid_config_rejected() {
    let mem: Arc<dyn PhysMemory> = Arc::new(GuestRam::new(0, 4096));
    let config = TcgConfig {
        promotion_threshold: 0,
        ..TcgConfig::default()
    };
    assert!(matches!(
        ExecEnv::with_config(config, mem),
        Err(TcgError::Config(ConfigError::PromotionThreshold(0)))
    ));
}

#[test]
fn test_stats_serialize() {
    let mut m = Machine::new(test_config());
    m.load(0x1000, &[addi(1, 0, 1), ECALL]);
    m.cpu.pc = 0x1000;
    m.run(None);

    let exec = serde_json::to_value(m.env.stats()).unwrap();
    assert_eq!(exec["interp_blocks"], 1);
    assert_eq!(exec["exceptions"], 1);
    let cache = serde_json::to_value(m.env.cache().stats_snapshot()).unwrap();
    assert_eq!(cache["installs"], 0);
    assert_eq!(cache["misses"], 1);
}

#[test]
fn test_bare_translator_runs_at_ram_base() {
    let mut m = Machine::new(test_config());
    m.load(0, &[addi(3, 0, 3), EBREAK]);
    let r = cpu_exec_loop(
        &mut m.env,
        &mut m.cpu,
        &BareTranslator,
        &mut MachineTrapHandler,
        None,
    );
    assert_eq!(r, ExitReason::Halted(Trap::Exception(GuestFault::Breakpoint(4))));
    assert_eq!(m.cpu.gpr[3], 3);
}

#[test]
fn test_odd_pc_faults_before_fetch() {
    let mut m = Machine::new(test_config());
    m.load(0x1ffc, &[addi(1, 0, 1), addi(1, 0, 2)]);
    m.cpu.pc = 0x1fff;

    assert_eq!(
        m.run(None),
        ExitReason::Halted(Trap::Exception(GuestFault::InstructionMisaligned(0x1fff)))
    );
    assert_eq!(m.cpu.gpr[1], 0);
    assert_eq!(m.env.stats().interp_blocks, 0);
    assert_eq!(m.env.cache().hotness().get(0x1ffe), 0);
    assert_eq!(m.env.cache().stats_snapshot().misses, 0);
}

#[test]
fn test_odd_entry_never_compiles() {
    let m = Machine::new(test_config());
    m.load(0x1ffc, &[addi(1, 0, 1)]);
    let shared = m.env.shared();
    assert_eq!(
        process(shared, task(0x1fff)).unwrap_err(),
        CompileAbort::Empty { pa: 0x1fff }
    );
    assert!(!shared.queue.in_flight(0x1fff));

    // A snapshot cut mid-halfword ends the block instead of reading on.
    let snap = CompilationSnapshot {
        entry_pa: 0x1ffe,
        entry_va: 0x1ffe,
        bytes: vec![0x13],
        stamp: ValidityStamp::new(PageStamp { pfn: 1, version: 0 }),
    };
    assert_eq!(
        compile(&shared.backend, &shared.config, &snap).unwrap_err(),
        CompileAbort::Empty { pa: 0x1ffe }
    );
}

#[test]
fn test_fetch_fault_still_polls_interrupts() {
    let mut m = Machine::new(test_config());
    m.cpu.pc = 0x5000;
    m.cpu.mstatus |= MSTATUS_MIE;
    m.cpu.mie |= 1 << IRQ_M_TIMER;
    m.cpu.irq.raise(IRQ_M_TIMER);

    let mut seen = Vec::new();
    let mut handler = |_: &mut RiscvCpu, trap: Trap| {
        seen.push(trap);
        match trap {
            Trap::Exception(_) => TrapAction::Resume,
            Trap::Interrupt(_) => TrapAction::Halt,
        }
    };
    let r = cpu_exec_loop(&mut m.env, &mut m.cpu, &NoExecPage(5), &mut handler, Some(1));

    assert_eq!(r, ExitReason::Halted(Trap::Interrupt(IRQ_M_TIMER)));
    assert_eq!(
        seen,
        [
            Trap::Exception(GuestFault::InstructionPageFault(0x5000)),
            Trap::Interrupt(IRQ_M_TIMER),
        ]
    );
    let s = m.env.stats();
    assert_eq!((s.exceptions, s.interrupts), (1, 1));
}
