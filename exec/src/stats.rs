//! Execution and cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared translation-cache counters, updated from both threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub installs: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
    pub stale_aborts: AtomicU64,
    pub duplicate_aborts: AtomicU64,
    pub exhausted_aborts: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub installs: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub stale_aborts: u64,
    pub duplicate_aborts: u64,
    pub exhausted_aborts: u64,
}

impl CacheStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits: ld(&self.hits),
            misses: ld(&self.misses),
            installs: ld(&self.installs),
            evictions: ld(&self.evictions),
            invalidations: ld(&self.invalidations),
            stale_aborts: ld(&self.stale_aborts),
            duplicate_aborts: ld(&self.duplicate_aborts),
            exhausted_aborts: ld(&self.exhausted_aborts),
        }
    }
}

/// Per-CPU execution counters. Owned by the execution thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecStats {
    pub interp_blocks: u64,
    pub interp_insns: u64,
    pub compiled_blocks: u64,
    pub compiled_insns: u64,
    /// Dispatches served from the per-CPU jump cache.
    pub jump_cache_hits: u64,
    /// Dispatches that skipped translation via a same-page exit.
    pub chained: u64,
    /// Blocks interpreted because their page was in SMC state.
    pub forced_interp: u64,
    pub interrupts: u64,
    pub exceptions: u64,
    pub compile_requests: u64,
    pub compile_dropped: u64,
}
