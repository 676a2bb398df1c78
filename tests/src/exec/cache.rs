//! Translation cache, page tables, hotness and the compile queue.

use std::sync::Arc;

use tcg_backend::CodeArena;
use tcg_core::{
    pfn, BlockEnd, CompileAbort, CompiledBlock, JumpCache, PageStamp,
    ValidityStamp,
};
use tcg_exec::worker::process;
use tcg_exec::{
    CompileQueue, CompileTask, Enqueue, PageState, TranslationCache,
};

use crate::rv::*;

/// Cache over 16 frames starting at PA 0, with the smallest arena
/// the host allows.
fn small_cache() -> TranslationCache {
    let arena = CodeArena::new(4096).unwrap();
    TranslationCache::new(arena, 0, 16, 4)
}

fn capacity(cache: &TranslationCache) -> usize {
    cache.lock().free_bytes()
}

fn current(cache: &TranslationCache, pfn: u64) -> PageStamp {
    PageStamp {
        pfn,
        version: cache.pages().version(pfn),
    }
}

/// Allocate, fill and install a block of `size` host bytes the way
/// the commit phase does.
fn install_with(
    cache: &TranslationCache,
    pa: u64,
    size: usize,
    stamp: ValidityStamp,
) -> Result<Arc<CompiledBlock>, CompileAbort> {
    let mut st = cache.lock();
    let extent = cache.evict_if_full(&mut st, size)?;
    cache.write_code(&st, &extent, &vec![0xAA; size]);
    let block = Arc::new(CompiledBlock::new(
        pa,
        pa,
        4,
        1,
        extent,
        BlockEnd::DirectBranch,
        false,
        stamp,
    ));
    assert!(cache.install(&mut st, Arc::clone(&block)));
    Ok(block)
}

fn install_fake(
    cache: &TranslationCache,
    pa: u64,
    size: usize,
) -> Result<Arc<CompiledBlock>, CompileAbort> {
    let stamp = ValidityStamp::new(current(cache, pfn(pa)));
    install_with(cache, pa, size, stamp)
}

fn task(pa: u64) -> CompileTask {
    CompileTask {
        entry_pa: pa,
        entry_va: pa,
        next_page_pa: None,
    }
}

// ── Page versions and hotness ─────────────────────────────────

#[test]
fn test_page_versions() {
    let cache = small_cache();
    let pages = cache.pages();
    assert_eq!(pages.num_pages(), 16);
    assert!(pages.covers(15));
    assert!(!pages.covers(16));
    assert_eq!(pages.version(3), 0);

    let st = cache.lock();
    assert_eq!(pages.bump(&st, 3), 1);
    assert_eq!(pages.bump(&st, 3), 2);
    assert_eq!(pages.version(3), 2);
    assert_eq!(pages.version(4), 0);
    // Untracked frames never move.
    assert_eq!(pages.bump(&st, 100), 0);
    assert_eq!(pages.version(100), 0);

    assert_eq!(pages.state(3), PageState::Normal);
    pages.set_state(&st, 3, PageState::SmcDetected);
    assert_eq!(pages.state(3), PageState::SmcDetected);
    pages.set_state(&st, 3, PageState::Normal);
    assert_eq!(pages.state(3), PageState::Normal);
}

#[test]
fn test_hotness_counts_per_halfword() {
    let cache = small_cache();
    let hot = cache.hotness();
    assert_eq!(hot.threshold(), 4);
    assert_eq!(hot.get(0x1000), 0);

    for n in 1..=4 {
        assert_eq!(hot.increment(0x1000), n);
    }
    assert!(hot.is_hot(hot.get(0x1000)));
    assert_eq!(hot.increment(0x1002), 1);
    assert_eq!(hot.get(0x2000), 0);
    // Outside RAM nothing is counted.
    assert_eq!(hot.increment(0x10_0000), 0);

    let st = cache.lock();
    hot.reset_page(&st, 1);
    assert_eq!(hot.get(0x1000), 0);
    assert_eq!(hot.get(0x1002), 0);
    // Never-touched frames reset as a no-op.
    hot.reset_page(&st, 5);
}

#[test]
fn test_hotness_saturates() {
    let cache = small_cache();
    let hot = cache.hotness();
    for _ in 0..u16::MAX as u32 + 10 {
        hot.increment(0x3000);
    }
    assert_eq!(hot.get(0x3000), u16::MAX);
}

// ── Install, lookup and eviction ──────────────────────────────

#[test]
fn test_install_and_lookup() {
    let cache = small_cache();
    assert!(cache.is_empty());
    assert!(cache.lookup(0x1000).is_none());

    install_fake(&cache, 0x1000, 64).unwrap();
    let b = cache.lookup(0x1000).unwrap();
    assert_eq!(b.entry_pa, 0x1000);
    assert_eq!(cache.code(&b)[..4], [0xAA; 4]);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.lock().blocks_in(1), &[0x1000]);

    let s = cache.stats_snapshot();
    assert_eq!((s.hits, s.misses, s.installs), (1, 1, 1));
}

#[test]
fn test_lru_eviction() {
    let cache = small_cache();
    let quarter = capacity(&cache) / 4;
    for pa in [0x1000, 0x2000, 0x3000, 0x4000] {
        install_fake(&cache, pa, quarter).unwrap();
    }
    assert_eq!(cache.lock().free_bytes(), 0);

    // 0x2000 is now the least recently used.
    cache.touch(&cache.lookup(0x1000).unwrap());
    install_fake(&cache, 0x5000, quarter).unwrap();

    assert!(cache.contains(0x1000));
    assert!(!cache.contains(0x2000));
    assert!(cache.contains(0x3000));
    assert!(cache.contains(0x4000));
    assert!(cache.contains(0x5000));
    assert_eq!(cache.stats_snapshot().evictions, 1);
    assert!(cache.lock().blocks_in(2).is_empty());
}

#[test]
fn test_eviction_after_every_block_was_hit() {
    let cache = small_cache();
    let quarter = capacity(&cache) / 4;
    for pa in [0x1000, 0x2000, 0x3000, 0x4000] {
        install_fake(&cache, pa, quarter).unwrap();
    }
    // Hit in a different order than installed; 0x3000 is now oldest.
    for pa in [0x3000, 0x1000, 0x4000, 0x2000] {
        cache.touch(&cache.lookup(pa).unwrap());
    }

    install_fake(&cache, 0x5000, quarter).unwrap();
    assert!(!cache.contains(0x3000));
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.stats_snapshot().evictions, 1);
}

#[test]
fn test_eviction_passes_over_running_block() {
    let cache = small_cache();
    let half = capacity(&cache) / 2;
    // `a` is older but still held, as a running block would be.
    let a = install_fake(&cache, 0x1000, half).unwrap();
    let b_range = install_fake(&cache, 0x2000, half).unwrap().host_range();

    let c = install_fake(&cache, 0x3000, half).unwrap();
    assert!(cache.contains(0x1000));
    assert!(a.is_valid());
    assert!(!cache.contains(0x2000));
    assert_eq!(c.host_range(), b_range);
    assert_eq!(cache.stats_snapshot().evictions, 1);
    assert_eq!(cache.lock().retired(), 0);
}

#[test]
fn test_jump_cache_does_not_block_eviction() {
    let cache = small_cache();
    let quarter = capacity(&cache) / 4;
    let mut jc = JumpCache::new();
    // Distinct jump-cache slots.
    for pa in [0x1000, 0x1100, 0x1200, 0x1300] {
        install_fake(&cache, pa, quarter).unwrap();
        jc.insert(&cache.lookup(pa).unwrap());
    }

    install_fake(&cache, 0x5000, quarter).unwrap();
    assert_eq!(cache.len(), 4);
    assert!(!cache.contains(0x1000));
    let s = cache.stats_snapshot();
    assert_eq!((s.evictions, s.exhausted_aborts), (1, 0));
    assert_eq!(cache.lock().retired(), 0);

    assert!(jc.lookup(0x1000).is_none());
    assert!(jc.lookup(0x1100).is_some());
}

#[test]
fn test_retired_block_reclaimed_after_last_reference() {
    let cache = small_cache();
    let cap = capacity(&cache);
    let half = cap / 2;
    let a = install_fake(&cache, 0x1000, half).unwrap();

    let mut st = cache.lock();
    assert_eq!(cache.invalidate(&mut st, 1), 1);
    assert_eq!(st.retired(), 1);
    // Still referenced: the extent stays readable and allocated.
    assert_eq!(cache.reclaim(&mut st), 0);
    assert_eq!(cache.code(&a)[..4], [0xAA; 4]);
    assert_eq!(st.free_bytes(), cap - half);

    drop(a);
    assert_eq!(cache.reclaim(&mut st), 1);
    assert_eq!(st.retired(), 0);
    assert_eq!(st.free_bytes(), cap);
}

#[test]
fn test_arena_exhausted() {
    let cache = small_cache();
    let cap = capacity(&cache);

    let err = install_fake(&cache, 0x1000, cap + 1).unwrap_err();
    assert_eq!(err, CompileAbort::ArenaExhausted { needed: cap + 1 });

    // The only block is in use: it stays installed.
    let _held = install_fake(&cache, 0x1000, cap).unwrap();
    let err = install_fake(&cache, 0x2000, 16).unwrap_err();
    assert_eq!(err, CompileAbort::ArenaExhausted { needed: 16 });
    assert!(cache.contains(0x1000));
    let s = cache.stats_snapshot();
    assert_eq!((s.evictions, s.exhausted_aborts), (0, 1));
}

#[test]
fn test_eviction_keeps_hotness_but_stores_reset_it() {
    let mut m = Machine::new(test_config());
    m.load(0x2000, &[addi(1, 1, 1), jal(0, -4)]);
    m.cpu.pc = 0x2000;
    m.run(Some(3));
    assert_eq!(m.env.cache().hotness().get(0x2000), 3);
    process(m.env.shared(), task(0x2000)).unwrap();

    // Fill what is left, then force out the least recently used.
    let cache = m.env.cache();
    install_fake(cache, 0x8000, capacity(cache)).unwrap();
    install_fake(cache, 0x9000, 16).unwrap();
    assert!(!cache.contains(0x2000));
    assert!(cache.contains(0x8000));
    assert_eq!(cache.stats_snapshot().evictions, 1);
    assert_eq!(cache.hotness().get(0x2000), 3);

    m.env.store(0x2004, &jal(0, -4).to_le_bytes()).unwrap();
    assert_eq!(m.env.cache().hotness().get(0x2000), 0);
}

// ── Invalidation ──────────────────────────────────────────────

#[test]
fn test_invalidate_frame() {
    let cache = small_cache();
    let a = install_fake(&cache, 0x1000, 32).unwrap();
    install_fake(&cache, 0x1100, 32).unwrap();
    install_fake(&cache, 0x2000, 32).unwrap();
    let gen = cache.retire_gen();

    let mut st = cache.lock();
    assert_eq!(cache.invalidate(&mut st, 1), 2);
    assert_eq!(cache.invalidate(&mut st, 1), 0);
    assert_eq!(cache.invalidate(&mut st, 99), 0);
    assert!(st.blocks_in(1).is_empty());
    assert_eq!(st.blocks_in(2), &[0x2000]);
    drop(st);

    assert!(!a.is_valid());
    assert!(!cache.contains(0x1100));
    assert!(cache.contains(0x2000));
    assert_eq!(cache.retire_gen(), gen + 2);
    assert_eq!(cache.stats_snapshot().invalidations, 2);
}

#[test]
fn test_two_page_block_indexed_under_both_frames() {
    let cache = small_cache();
    let stamp = ValidityStamp::with_second(current(&cache, 3), current(&cache, 4));
    install_with(&cache, 0x3ffc, 32, stamp).unwrap();
    {
        let st = cache.lock();
        assert_eq!(st.blocks_in(3), &[0x3ffc]);
        assert_eq!(st.blocks_in(4), &[0x3ffc]);
    }

    // A write to the second frame alone kills it.
    let mut st = cache.lock();
    assert_eq!(cache.invalidate(&mut st, 4), 1);
    assert!(st.blocks_in(3).is_empty());
    drop(st);
    assert!(!cache.contains(0x3ffc));
}

// ── Compile queue ─────────────────────────────────────────────

#[test]
fn test_queue_dedup_and_bound() {
    let (tx, q) = CompileQueue::new(2);
    assert_eq!(q.request(&tx, task(0x1000)), Enqueue::Sent);
    assert_eq!(q.request(&tx, task(0x1000)), Enqueue::InFlight);
    assert_eq!(q.request(&tx, task(0x2000)), Enqueue::Sent);
    assert_eq!(q.request(&tx, task(0x3000)), Enqueue::Full);
    assert_eq!(q.pending(), 2);
    assert!(q.in_flight(0x1000));
    assert!(!q.in_flight(0x3000), "dropped request is not in flight");

    assert_eq!(q.try_recv(), Some(task(0x1000)));
    // Still in flight until its compilation finishes.
    assert_eq!(q.request(&tx, task(0x1000)), Enqueue::InFlight);
    q.complete(0x1000);
    assert!(!q.in_flight(0x1000));
    assert_eq!(q.request(&tx, task(0x1000)), Enqueue::Sent);
}

#[test]
fn test_queue_drains_after_disconnect() {
    let (tx, q) = CompileQueue::new(4);
    q.request(&tx, task(0x1000));
    drop(tx);
    assert_eq!(q.recv(), Ok(task(0x1000)));
    assert!(q.recv().is_err());
    assert_eq!(q.try_recv(), None);
}
