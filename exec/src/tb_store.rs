//! PA-keyed translation cache.
//!
//! Lookups take a shared read lock on the PA map (or skip it
//! entirely via the per-CPU jump cache) and never wait for a
//! compilation. Everything that changes what is installed goes
//! through the single cache lock, which also guards the reverse
//! index, the arena allocator and the page version table.
//!
//! Blocks leaving the map are marked invalid and retired; their
//! arena extent is only reused once no other `Arc` to the block
//! exists, so code that is executing is never overwritten. Jump
//! caches hold weak references and never pin an extent.
//!
//! Hits stamp blocks with a logical clock without taking any lock.
//! The LRU index under the cache lock catches up lazily: when the
//! oldest entry turns out to have been hit since it was filed, it is
//! refiled under its current tick and the next oldest is tried.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tcg_backend::{ArenaAllocator, CodeArena};
use tcg_core::{invariant, CompileAbort, CompiledBlock};

use crate::hotness::HotnessTable;
use crate::page_version::PageVersionTable;
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// State guarded by the cache lock.
pub struct CacheState {
    base_pfn: u64,
    /// Frame -> entry PAs of blocks with code in that frame.
    reverse: Box<[Vec<u64>]>,
    alloc: ArenaAllocator,
    /// `(tick, entry PA)` of installed blocks, oldest first. A tick
    /// may lag behind the block's last hit.
    lru: BTreeSet<(u64, u64)>,
    /// Entry PA -> tick it is filed under in `lru`.
    lru_tick: HashMap<u64, u64>,
    retired: Vec<Arc<CompiledBlock>>,
}

impl CacheState {
    fn frame(&mut self, pfn: u64) -> Option<&mut Vec<u64>> {
        let i = pfn.checked_sub(self.base_pfn)? as usize;
        self.reverse.get_mut(i)
    }

    /// Entry PAs registered under `pfn`.
    pub fn blocks_in(&self, pfn: u64) -> &[u64] {
        pfn.checked_sub(self.base_pfn)
            .and_then(|i| self.reverse.get(i as usize))
            .map_or(&[][..], Vec::as_slice)
    }

    pub fn free_bytes(&self) -> usize {
        self.alloc.free_bytes()
    }

    fn file_lru(&mut self, pa: u64, tick: u64) {
        if let Some(old) = self.lru_tick.insert(pa, tick) {
            self.lru.remove(&(old, pa));
        }
        self.lru.insert((tick, pa));
    }

    /// Blocks waiting for their last reference to go away.
    pub fn retired(&self) -> usize {
        self.retired.len()
    }
}

/// Why a block left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Evicted,
    Invalidated,
}

pub struct TranslationCache {
    map: RwLock<HashMap<u64, Arc<CompiledBlock>>>,
    state: Mutex<CacheState>,
    arena: CodeArena,
    pages: PageVersionTable,
    hotness: HotnessTable,
    /// Logical clock for LRU stamps.
    clock: AtomicU64,
    /// Bumped whenever a block is retired; per-CPU caches purge
    /// their dead slots when it moves.
    retire_gen: AtomicU64,
    stats: CacheStats,
}

impl TranslationCache {
    pub fn new(
        arena: CodeArena,
        base_pfn: u64,
        num_pages: usize,
        threshold: u16,
    ) -> Self {
        let alloc = ArenaAllocator::new(arena.capacity());
        Self {
            map: RwLock::new(HashMap::new()),
            state: Mutex::new(CacheState {
                base_pfn,
                reverse: (0..num_pages).map(|_| Vec::new()).collect(),
                alloc,
                lru: BTreeSet::new(),
                lru_tick: HashMap::new(),
                retired: Vec::new(),
            }),
            arena,
            pages: PageVersionTable::new(base_pfn, num_pages),
            hotness: HotnessTable::new(base_pfn, num_pages, threshold),
            clock: AtomicU64::new(0),
            retire_gen: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Acquire the cache lock.
    pub fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    pub fn pages(&self) -> &PageVersionTable {
        &self.pages
    }

    pub fn hotness(&self) -> &HotnessTable {
        &self.hotness
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn retire_gen(&self) -> u64 {
        self.retire_gen.load(Ordering::Acquire)
    }

    // -- Read path --

    /// Installed block at `pa`, if any.
    pub fn lookup(&self, pa: u64) -> Option<Arc<CompiledBlock>> {
        let found = self.map.read().get(&pa).cloned();
        match found {
            Some(_) => CacheStats::bump(&self.stats.hits),
            None => CacheStats::bump(&self.stats.misses),
        }
        found
    }

    pub fn contains(&self, pa: u64) -> bool {
        self.map.read().contains_key(&pa)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a hit for LRU ordering.
    #[inline]
    pub fn touch(&self, block: &CompiledBlock) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        block.touch(tick);
    }

    /// Host code of `block`. The caller's reference keeps the extent
    /// from being reused.
    pub fn code<'a>(&'a self, block: &'a CompiledBlock) -> &'a [u8] {
        self.arena.code(block.host_range())
    }

    // -- Write path (cache lock held) --

    /// Make room for `size` bytes of host code, evicting least
    /// recently used blocks until the allocation fits. Blocks another
    /// thread is executing are passed over, not evicted.
    pub fn evict_if_full(
        &self,
        st: &mut CacheState,
        size: usize,
    ) -> Result<Range<usize>, CompileAbort> {
        if ArenaAllocator::rounded(size) > st.alloc.capacity() {
            return Err(CompileAbort::ArenaExhausted { needed: size });
        }
        self.reclaim(st);
        loop {
            if let Some(extent) = st.alloc.alloc(size) {
                return Ok(extent);
            }
            let Some(pa) = self.lru_victim(st) else {
                CacheStats::bump(&self.stats.exhausted_aborts);
                return Err(CompileAbort::ArenaExhausted { needed: size });
            };
            self.remove(st, pa, Removal::Evicted);
            self.reclaim(st);
        }
    }

    /// Least recently used installed block nothing else references.
    fn lru_victim(&self, st: &mut CacheState) -> Option<u64> {
        let map = self.map.read();
        let mut running = Vec::new();
        // Refiling moves an entry forward, so this only runs long if
        // blocks are hit faster than they are looked at.
        let mut budget = 2 * st.lru_tick.len() + 2;
        let victim = loop {
            budget -= 1;
            if budget == 0 {
                break None;
            }
            let Some((filed, pa)) = st.lru.pop_first() else {
                break None;
            };
            let Some(block) = map.get(&pa) else {
                st.lru_tick.remove(&pa);
                continue;
            };
            let tick = block.last_used();
            if tick != filed {
                st.lru.insert((tick, pa));
                st.lru_tick.insert(pa, tick);
            } else if Arc::strong_count(block) > 1 {
                running.push((filed, pa));
            } else {
                // `remove` drops the rest of its LRU state.
                break Some(pa);
            }
        };
        st.lru.extend(running);
        victim
    }

    /// Copy host code into an extent returned by
    /// [`evict_if_full`](Self::evict_if_full).
    pub fn write_code(&self, _st: &CacheState, extent: &Range<usize>, code: &[u8]) {
        assert!(code.len() <= extent.len());
        // SAFETY: the extent was just allocated under the cache lock
        // and no installed block refers to it yet.
        unsafe { self.arena.write(extent.start, code) };
    }

    /// Publish `block` to lookups and register it in the reverse
    /// index. Refuses (returning `false`) a second block for the same
    /// PA or a block whose stamp no longer matches live versions;
    /// both mean the caller skipped its commit checks.
    pub fn install(&self, st: &mut CacheState, block: Arc<CompiledBlock>) -> bool {
        let pa = block.entry_pa;
        let stale = block.stamp.first_mismatch(|p| self.pages.version(p));
        let fresh = invariant!(stale.is_none(), "installing stale block at {pa:#x}");
        let inserted = fresh && {
            let mut map = self.map.write();
            invariant!(!map.contains_key(&pa), "double install at {pa:#x}")
                && map.insert(pa, Arc::clone(&block)).is_none()
        };
        if !inserted {
            // Hand the extent back through the normal reclaim path.
            block.mark_invalid();
            st.retired.push(block);
            return false;
        }
        for page in block.stamp.pages() {
            if let Some(list) = st.frame(page.pfn) {
                list.push(pa);
            }
        }
        self.touch(&block);
        st.file_lru(pa, block.last_used());
        CacheStats::bump(&self.stats.installs);
        log::debug!(
            "[tcg-cache] install {pa:#x}: {} insns, {} guest bytes, {} host bytes",
            block.insn_count,
            block.guest_len,
            block.host_size
        );
        true
    }

    /// Remove every block with code in frame `pfn`. Returns how many
    /// were removed; an empty frame is a no-op.
    pub fn invalidate(&self, st: &mut CacheState, pfn: u64) -> usize {
        let Some(list) = st.frame(pfn) else {
            return 0;
        };
        let victims = std::mem::take(list);
        let mut removed = 0;
        for pa in victims {
            if self.remove(st, pa, Removal::Invalidated) {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("[tcg-cache] invalidated {removed} blocks in frame {pfn:#x}");
        }
        removed
    }

    fn remove(&self, st: &mut CacheState, pa: u64, why: Removal) -> bool {
        let Some(block) = self.map.write().remove(&pa) else {
            return false;
        };
        block.mark_invalid();
        if let Some(tick) = st.lru_tick.remove(&pa) {
            st.lru.remove(&(tick, pa));
        }
        for page in block.stamp.pages() {
            if let Some(list) = st.frame(page.pfn) {
                list.retain(|&p| p != pa);
            }
        }
        match why {
            Removal::Evicted => {
                CacheStats::bump(&self.stats.evictions);
                log::debug!("[tcg-cache] evict {pa:#x} (lru {})", block.last_used());
            }
            Removal::Invalidated => CacheStats::bump(&self.stats.invalidations),
        }
        st.retired.push(block);
        self.retire_gen.fetch_add(1, Ordering::Release);
        true
    }

    /// Free the arena extents of retired blocks nobody references.
    pub fn reclaim(&self, st: &mut CacheState) -> usize {
        let CacheState { retired, alloc, .. } = st;
        // Pairs with the fence in `JumpCache::lookup`: a reader that
        // upgraded its weak reference after this point sees the block
        // marked invalid and drops it unused.
        fence(Ordering::SeqCst);
        let before = retired.len();
        retired.retain(|b| {
            if Arc::strong_count(b) == 1 {
                alloc.free(b.host_range());
                false
            } else {
                true
            }
        });
        before - retired.len()
    }
}
