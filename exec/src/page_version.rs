//! Per-physical-page version counters and execution state.
//!
//! Reads are lock-free atomics. Every mutation takes a
//! `&CacheState`, which can only be obtained by holding the cache
//! lock.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::tb_store::CacheState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    Normal = 0,
    /// A store hit the page code is currently fetched from; fetches
    /// from it are interpreted until fetch moves to another page.
    SmcDetected = 1,
}

pub struct PageVersionTable {
    base_pfn: u64,
    versions: Box<[AtomicU64]>,
    states: Box<[AtomicU8]>,
}

impl PageVersionTable {
    pub fn new(base_pfn: u64, num_pages: usize) -> Self {
        Self {
            base_pfn,
            versions: (0..num_pages).map(|_| AtomicU64::new(0)).collect(),
            states: (0..num_pages)
                .map(|_| AtomicU8::new(PageState::Normal as u8))
                .collect(),
        }
    }

    #[inline]
    fn index(&self, pfn: u64) -> Option<usize> {
        let i = pfn.checked_sub(self.base_pfn)? as usize;
        (i < self.versions.len()).then_some(i)
    }

    /// Whether `pfn` is RAM tracked by this table.
    pub fn covers(&self, pfn: u64) -> bool {
        self.index(pfn).is_some()
    }

    pub fn num_pages(&self) -> usize {
        self.versions.len()
    }

    /// Current version of `pfn`. Untracked frames are always 0.
    #[inline]
    pub fn version(&self, pfn: u64) -> u64 {
        self.index(pfn)
            .map_or(0, |i| self.versions[i].load(Ordering::Acquire))
    }

    #[inline]
    pub fn state(&self, pfn: u64) -> PageState {
        match self.index(pfn) {
            Some(i) if self.states[i].load(Ordering::Acquire) != 0 => {
                PageState::SmcDetected
            }
            _ => PageState::Normal,
        }
    }

    /// Record a write to `pfn`. Returns the new version.
    pub fn bump(&self, _lock: &CacheState, pfn: u64) -> u64 {
        match self.index(pfn) {
            Some(i) => self.versions[i].fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        }
    }

    pub fn set_state(&self, _lock: &CacheState, pfn: u64, state: PageState) {
        if let Some(i) = self.index(pfn) {
            self.states[i].store(state as u8, Ordering::Release);
        }
    }
}
