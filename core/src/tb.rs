use std::ops::Range;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::GuestFault;

/// Version of one physical page as captured when a block was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageStamp {
    pub pfn: u64,
    pub version: u64,
}

/// The page versions a block was compiled against.
///
/// One page for ordinary blocks, two when the last instruction is
/// an RVC-aligned 32-bit instruction crossing into the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityStamp {
    first: PageStamp,
    second: Option<PageStamp>,
}

impl ValidityStamp {
    pub fn new(first: PageStamp) -> Self {
        Self {
            first,
            second: None,
        }
    }

    pub fn with_second(first: PageStamp, second: PageStamp) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }

    pub fn first(&self) -> PageStamp {
        self.first
    }

    pub fn second(&self) -> Option<PageStamp> {
        self.second
    }

    pub fn pages(&self) -> impl Iterator<Item = PageStamp> {
        std::iter::once(self.first).chain(self.second)
    }

    pub fn spans_two_pages(&self) -> bool {
        self.second.is_some()
    }

    /// Compare every captured version against `live(pfn)`.
    /// Returns the first page whose version moved.
    pub fn first_mismatch(
        &self,
        mut live: impl FnMut(u64) -> u64,
    ) -> Option<u64> {
        self.pages()
            .find(|p| live(p.pfn) != p.version)
            .map(|p| p.pfn)
    }
}

/// How the last instruction of a block ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// Conditional branch or JAL; both arms exit with a known target.
    DirectBranch,
    /// JALR; the computed target goes back to the execution loop.
    IndirectJump,
    /// CSR access, FENCE.I, MRET, WFI: state the translation
    /// depends on may have changed.
    Serializing,
    /// ECALL/EBREAK; the block always exits with an exception.
    Trap,
    /// The next instruction starts on another page.
    PageBoundary,
    /// Reached the per-block instruction cap.
    InsnLimit,
    /// The next instruction does not decode; the interpreter
    /// raises the fault when it gets there.
    Undecodable,
}

/// A compiled basic block, owned by the translation cache.
///
/// Maps to QEMU's `TranslationBlock`, keyed by guest physical
/// address rather than by (pc, flags).
#[derive(Debug)]
pub struct CompiledBlock {
    /// Guest physical address of the first instruction.
    pub entry_pa: u64,
    /// Guest virtual address the block was requested at. Only
    /// informational: the same PA may be entered through any VA.
    pub entry_va: u64,
    /// Guest bytes covered, starting at `entry_pa`.
    pub guest_len: u32,
    /// Guest instructions in the straight-line body.
    pub insn_count: u32,
    /// Offset of the host code in the code arena.
    pub host_offset: usize,
    /// Size of the host code in bytes.
    pub host_size: usize,
    pub end: BlockEnd,
    /// Whether the block closes a host-level loop over its own body.
    pub has_loop: bool,
    /// Page versions the block was built against.
    pub stamp: ValidityStamp,

    invalid: AtomicBool,
    last_used: AtomicU64,
}

impl CompiledBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry_pa: u64,
        entry_va: u64,
        guest_len: u32,
        insn_count: u32,
        host: Range<usize>,
        end: BlockEnd,
        has_loop: bool,
        stamp: ValidityStamp,
    ) -> Self {
        Self {
            entry_pa,
            entry_va,
            guest_len,
            insn_count,
            host_offset: host.start,
            host_size: host.end - host.start,
            end,
            has_loop,
            stamp,
            invalid: AtomicBool::new(false),
            last_used: AtomicU64::new(0),
        }
    }

    pub fn host_range(&self) -> Range<usize> {
        self.host_offset..self.host_offset + self.host_size
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    /// Mark the block dead. Called by the cache when the block
    /// leaves the PA map; per-CPU caches notice on their next lookup.
    pub fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    /// Record a use at logical time `tick` for LRU ordering.
    #[inline]
    pub fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Relaxed);
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

/// Exit classification produced by compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Ran to the end (or took a direct/indirect branch out).
    Fallthrough,
    /// An instruction faulted; `next_pc` is the faulting PC and
    /// the exception has not been taken yet.
    Exception(GuestFault),
    /// A safepoint observed a pending interrupt; `next_pc` is the
    /// first instruction not yet executed.
    Interrupt,
    /// A helper asked to leave compiled code (a store hit the
    /// block's own page); continue interpreting at `next_pc`.
    ToInterpreter,
}

/// Tagged result of running a compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    /// Guest VA to continue at.
    pub next_pc: u64,
    pub kind: ExitKind,
    /// Physical address of `next_pc` when it is a direct target on
    /// the block's own page; lets the dispatcher skip translation.
    pub chain_pa: Option<u64>,
    /// Guest instructions retired before the exit.
    pub insns: u64,
}

impl BlockExit {
    pub fn fallthrough(next_pc: u64, chain_pa: Option<u64>, insns: u64) -> Self {
        Self {
            next_pc,
            kind: ExitKind::Fallthrough,
            chain_pa,
            insns,
        }
    }

    pub fn exception(pc: u64, fault: GuestFault, insns: u64) -> Self {
        Self {
            next_pc: pc,
            kind: ExitKind::Exception(fault),
            chain_pa: None,
            insns,
        }
    }

    pub fn interrupt(pc: u64, insns: u64) -> Self {
        Self {
            next_pc: pc,
            kind: ExitKind::Interrupt,
            chain_pa: None,
            insns,
        }
    }

    pub fn to_interpreter(pc: u64, insns: u64) -> Self {
        Self {
            next_pc: pc,
            kind: ExitKind::ToInterpreter,
            chain_pa: None,
            insns,
        }
    }
}

/// Number of entries in the per-CPU jump cache.
pub const TB_JMP_CACHE_SIZE: usize = 1 << 12; // 4096

/// Per-CPU direct-mapped block cache, indexed by physical PC.
///
/// Slots hold weak references: the translation cache owns blocks,
/// and an evicted block's arena extent must not be pinned by a CPU
/// that merely ran it once. A slot is only trusted when the block
/// is still alive, still valid and its PA matches.
pub struct JumpCache {
    entries: Box<[Weak<CompiledBlock>]>,
}

impl JumpCache {
    pub fn new() -> Self {
        Self {
            entries: (0..TB_JMP_CACHE_SIZE).map(|_| Weak::new()).collect(),
        }
    }

    fn index(pa: u64) -> usize {
        (pa as usize >> 1) & (TB_JMP_CACHE_SIZE - 1)
    }

    pub fn lookup(&mut self, pa: u64) -> Option<Arc<CompiledBlock>> {
        let slot = &mut self.entries[Self::index(pa)];
        let Some(b) = slot.upgrade() else {
            *slot = Weak::new();
            return None;
        };
        // Pairs with the fence in `TranslationCache::reclaim`: either
        // the cache sees our reference, or we see the block is dead.
        fence(Ordering::SeqCst);
        if !b.is_valid() {
            *slot = Weak::new();
            return None;
        }
        (b.entry_pa == pa).then_some(b)
    }

    pub fn insert(&mut self, block: &Arc<CompiledBlock>) {
        let idx = Self::index(block.entry_pa);
        self.entries[idx] = Arc::downgrade(block);
    }

    /// Clear every slot whose block is dead or gone.
    pub fn purge_invalid(&mut self) {
        for slot in self.entries.iter_mut() {
            if !slot.upgrade().is_some_and(|b| b.is_valid()) {
                *slot = Weak::new();
            }
        }
    }
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}
