//! Interpreted-execution counters driving promotion.
//!
//! One saturating 16-bit counter per guest halfword (the smallest
//! instruction alignment with RVC). Counter arrays are allocated per
//! frame on the first miss in that frame and reset in place after.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

use tcg_core::{page_offset, pfn, PAGE_SIZE};

use crate::tb_store::CacheState;

const SLOTS_PER_PAGE: usize = (PAGE_SIZE / 2) as usize;

pub struct HotnessTable {
    base_pfn: u64,
    threshold: u16,
    frames: Box<[OnceLock<Box<[AtomicU16]>>]>,
}

impl HotnessTable {
    pub fn new(base_pfn: u64, num_pages: usize, threshold: u16) -> Self {
        Self {
            base_pfn,
            threshold: threshold.max(1),
            frames: (0..num_pages).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    fn frame(&self, pfn: u64) -> Option<&OnceLock<Box<[AtomicU16]>>> {
        let i = pfn.checked_sub(self.base_pfn)? as usize;
        self.frames.get(i)
    }

    fn slot(pa: u64) -> usize {
        (page_offset(pa) >> 1) as usize
    }

    /// Current count at `pa`.
    pub fn get(&self, pa: u64) -> u16 {
        self.frame(pfn(pa))
            .and_then(OnceLock::get)
            .map_or(0, |c| c[Self::slot(pa)].load(Ordering::Relaxed))
    }

    /// Count one interpreted execution at `pa`; returns the new
    /// count. Saturates at `u16::MAX`. Untracked addresses stay 0.
    pub fn increment(&self, pa: u64) -> u16 {
        let Some(frame) = self.frame(pfn(pa)) else {
            return 0;
        };
        let counters = frame.get_or_init(|| {
            (0..SLOTS_PER_PAGE).map(|_| AtomicU16::new(0)).collect()
        });
        let c = &counters[Self::slot(pa)];
        match c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            v.checked_add(1)
        }) {
            Ok(prev) => prev + 1,
            Err(cur) => cur,
        }
    }

    /// Whether `count` makes a PA eligible for compilation.
    #[inline]
    pub fn is_hot(&self, count: u16) -> bool {
        count >= self.threshold
    }

    /// Zero every counter in frame `pfn`.
    pub fn reset_page(&self, _lock: &CacheState, pfn: u64) {
        if let Some(counters) = self.frame(pfn).and_then(OnceLock::get) {
            for c in counters.iter() {
                c.store(0, Ordering::Relaxed);
            }
        }
    }
}
