//! Compilation worker.
//!
//! Each task goes through three phases:
//!
//! 1. [`snapshot`] under the cache lock: capture page versions and
//!    copy the guest bytes into a private buffer.
//! 2. [`compile`] with no lock held: decode the private copy and
//!    emit host code into a private buffer.
//! 3. [`commit`] under the cache lock: re-check versions and the
//!    PA map, then copy into the arena and install.
//!
//! A failed phase yields a [`CompileAbort`], which is counted and
//! dropped. Hotness is left alone, so a PA that keeps missing is
//! requested again.

use std::sync::Arc;

use tcg_backend::{EmitContext, HostCodeGen};
use tcg_core::{
    page_offset, pfn, BlockEnd, CompileAbort, CompiledBlock, PageStamp,
    ValidityStamp, PAGE_SIZE,
};
use tcg_frontend::riscv::{decode, insn_len, Insn, InsnClass};

use crate::compile_queue::CompileTask;
use crate::stats::CacheStats;
use crate::SharedState;

/// Private copy of the guest code a block will be built from.
#[derive(Debug, Clone)]
pub struct CompilationSnapshot {
    pub entry_pa: u64,
    pub entry_va: u64,
    /// From `entry_pa` to the end of its page, plus the first
    /// halfword of the next page when it is executable.
    pub bytes: Vec<u8>,
    /// Entry page version, and the next page's when captured.
    pub stamp: ValidityStamp,
}

/// Host code for one block, not yet installed.
#[derive(Debug)]
pub struct CompiledCode {
    pub entry_pa: u64,
    pub entry_va: u64,
    pub code: Vec<u8>,
    pub guest_len: u32,
    pub insn_count: u32,
    pub end: BlockEnd,
    pub has_loop: bool,
    /// Only the pages the block actually reads.
    pub stamp: ValidityStamp,
}

/// Worker thread body. Runs until the queue's sender is dropped.
pub(crate) fn run<B: HostCodeGen>(shared: &SharedState<B>) {
    log::info!("[tcg-worker] compile worker started");
    let mut done = 0u64;
    while let Ok(task) = shared.queue.recv() {
        if process(shared, task).is_ok() {
            done += 1;
        }
    }
    log::info!("[tcg-worker] compile worker stopped after {done} installs");
}

/// Run all three phases for `task` and release its in-flight entry.
pub fn process<B: HostCodeGen>(
    shared: &SharedState<B>,
    task: CompileTask,
) -> Result<Arc<CompiledBlock>, CompileAbort> {
    let result = snapshot(shared, &task)
        .and_then(|snap| compile(&shared.backend, &shared.config, &snap))
        .and_then(|code| commit(shared, code));
    shared.queue.complete(task.entry_pa);

    if let Err(abort) = &result {
        let stats = shared.cache.stats();
        match abort {
            CompileAbort::StaleSnapshot { .. } => CacheStats::bump(&stats.stale_aborts),
            CompileAbort::AlreadyInstalled { .. } => {
                CacheStats::bump(&stats.duplicate_aborts)
            }
            _ => {}
        }
        log::debug!("[tcg-worker] abort {:#x}: {abort}", task.entry_pa);
    }
    result
}

/// Phase 1: capture versions and copy guest bytes (cache lock held).
pub fn snapshot<B>(
    shared: &SharedState<B>,
    task: &CompileTask,
) -> Result<CompilationSnapshot, CompileAbort> {
    let pa = task.entry_pa;
    // Instructions are halfword aligned; an odd PC faults in the
    // execution loop before it can be counted or queued.
    if pa & 1 != 0 {
        return Err(CompileAbort::Empty { pa });
    }
    let cache = &shared.cache;
    if cache.contains(pa) {
        return Err(CompileAbort::AlreadyInstalled { pa });
    }

    let on_page = (PAGE_SIZE - page_offset(pa)) as usize;
    let st = cache.lock();
    let first = PageStamp {
        pfn: pfn(pa),
        version: cache.pages().version(pfn(pa)),
    };
    let mut bytes = vec![0u8; on_page];
    shared
        .mem
        .read(pa, &mut bytes)
        .map_err(|_| CompileAbort::Empty { pa })?;

    let mut stamp = ValidityStamp::new(first);
    if let Some(next) = task.next_page_pa {
        let mut half = [0u8; 2];
        if shared.mem.read(next, &mut half).is_ok() {
            bytes.extend_from_slice(&half);
            let second = PageStamp {
                pfn: pfn(next),
                version: cache.pages().version(pfn(next)),
            };
            stamp = ValidityStamp::with_second(first, second);
        }
    }
    drop(st);

    Ok(CompilationSnapshot {
        entry_pa: pa,
        entry_va: task.entry_va,
        bytes,
        stamp,
    })
}

/// Decoded body of a block: `(offset, insn)` pairs.
struct Body {
    insns: Vec<(u64, Insn)>,
    guest_len: u64,
    end: BlockEnd,
    crosses: bool,
}

fn end_of(insn: &Insn) -> BlockEnd {
    match insn.class() {
        InsnClass::DirectBranch => BlockEnd::DirectBranch,
        InsnClass::IndirectJump => BlockEnd::IndirectJump,
        InsnClass::Serializing => BlockEnd::Serializing,
        InsnClass::Trap => BlockEnd::Trap,
        InsnClass::Sequential => BlockEnd::PageBoundary,
    }
}

fn scan(snap: &CompilationSnapshot, max_insns: u32) -> Body {
    let page_end = (PAGE_SIZE - page_offset(snap.entry_pa)) as usize;
    let bytes = &snap.bytes;
    let mut insns = Vec::new();
    let mut off = 0usize;

    let (end, crosses) = loop {
        if insns.len() >= max_insns as usize {
            break (BlockEnd::InsnLimit, false);
        }
        if off >= page_end {
            break (BlockEnd::PageBoundary, false);
        }
        let Some(&[lo, hi]) = bytes.get(off..off + 2) else {
            break (BlockEnd::PageBoundary, false);
        };
        let len = insn_len(u16::from_le_bytes([lo, hi]));
        let crosses = off + len > page_end;
        // Second half not captured: stop before the instruction and
        // let the interpreter check the next page.
        let Some(raw) = bytes.get(off..off + len) else {
            break (BlockEnd::PageBoundary, false);
        };
        let Ok(insn) = decode(raw) else {
            break (BlockEnd::Undecodable, false);
        };
        insns.push((off as u64, insn));
        off += len;
        if crosses || insn.ends_block() {
            break (end_of(&insn), crosses);
        }
    };
    Body {
        insns,
        guest_len: off as u64,
        end,
        crosses,
    }
}

/// Phase 2: decode and emit (no locks held).
pub fn compile<B: HostCodeGen>(
    backend: &B,
    config: &tcg_core::TcgConfig,
    snap: &CompilationSnapshot,
) -> Result<CompiledCode, CompileAbort> {
    let body = scan(snap, config.max_block_insns);
    let Some(&(last_off, last)) = body.insns.last() else {
        return Err(CompileAbort::Empty { pa: snap.entry_pa });
    };
    let base = snap.entry_va;

    // A direct branch back into the block on the same page becomes
    // a host loop headed by a safepoint.
    let header = match last.class() {
        InsnClass::DirectBranch if !body.crosses => {
            let target = last_off as i64 + last.imm;
            body.insns
                .iter()
                .position(|&(off, _)| off as i64 == target)
        }
        _ => None,
    };

    let mut ctx = EmitContext::new();
    backend.begin(&mut ctx, base);
    let interval = config.safepoint_interval as u64;
    let mut since_safepoint = 0u64;
    let mut label = None;
    for (i, &(off, insn)) in body.insns.iter().enumerate() {
        let pc = base.wrapping_add(off);
        if header == Some(i) {
            label = Some(backend.emit_safepoint(&mut ctx, pc));
            since_safepoint = 0;
        } else if since_safepoint >= interval {
            backend.emit_safepoint(&mut ctx, pc);
            since_safepoint = 0;
        }
        match label {
            Some(l) if i + 1 == body.insns.len() => {
                backend.emit_loop_branch(&mut ctx, &insn, pc, l)
            }
            _ => backend.emit_insn(&mut ctx, &insn, pc),
        }
        since_safepoint += 1;
    }
    backend.finish(&mut ctx, base.wrapping_add(body.guest_len));

    let stamp = match (body.crosses, snap.stamp.second()) {
        (true, Some(second)) => ValidityStamp::with_second(snap.stamp.first(), second),
        _ => ValidityStamp::new(snap.stamp.first()),
    };
    log::trace!(
        "[tcg-worker] compiled {:#x}: {} insns ending {:?}{}",
        snap.entry_pa,
        body.insns.len(),
        body.end,
        if header.is_some() { ", loop" } else { "" }
    );
    Ok(CompiledCode {
        entry_pa: snap.entry_pa,
        entry_va: snap.entry_va,
        code: ctx.buf.as_slice().to_vec(),
        guest_len: body.guest_len as u32,
        insn_count: body.insns.len() as u32,
        end: body.end,
        has_loop: header.is_some(),
        stamp,
    })
}

/// Phase 3: verify and install (cache lock held).
pub fn commit<B>(
    shared: &SharedState<B>,
    code: CompiledCode,
) -> Result<Arc<CompiledBlock>, CompileAbort> {
    let cache = &shared.cache;
    let pa = code.entry_pa;
    let mut st = cache.lock();

    if let Some(pfn) = code.stamp.first_mismatch(|p| cache.pages().version(p)) {
        return Err(CompileAbort::StaleSnapshot { pfn });
    }
    if cache.contains(pa) {
        return Err(CompileAbort::AlreadyInstalled { pa });
    }

    let extent = cache.evict_if_full(&mut st, code.code.len())?;
    cache.write_code(&st, &extent, &code.code);
    let block = Arc::new(CompiledBlock::new(
        pa,
        code.entry_va,
        code.guest_len,
        code.insn_count,
        extent,
        code.end,
        code.has_loop,
        code.stamp,
    ));
    if !cache.install(&mut st, Arc::clone(&block)) {
        return Err(CompileAbort::AlreadyInstalled { pa });
    }
    Ok(block)
}
