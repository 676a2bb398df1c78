//! Guest physical memory.

use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::addr::{pfn, PAGE_SIZE};

/// Physical access outside any backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("physical access out of range at {pa:#x} (+{len})")]
pub struct BusError {
    pub pa: u64,
    pub len: usize,
}

/// Physical memory as seen by the engine.
///
/// Read by the execution loop (fetch, loads) and by the compile
/// worker (snapshots). Writes that may hit guest code must go
/// through the engine's store hook so compiled code is invalidated
/// together with the write.
pub trait PhysMemory: Send + Sync {
    /// First physical address backed by this memory.
    fn base(&self) -> u64;

    /// Size in bytes.
    fn size(&self) -> u64;

    fn read(&self, pa: u64, buf: &mut [u8]) -> Result<(), BusError>;

    fn write(&self, pa: u64, data: &[u8]) -> Result<(), BusError>;

    /// Frame number of the first page.
    fn base_pfn(&self) -> u64 {
        pfn(self.base())
    }

    /// Number of whole pages backed.
    fn num_pages(&self) -> usize {
        (self.size() / PAGE_SIZE) as usize
    }

    fn contains(&self, pa: u64, len: usize) -> bool {
        pa >= self.base()
            && pa
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base() + self.size())
    }
}

/// Flat RAM at a fixed physical base.
///
/// Bytes are relaxed atomics so the compile worker can copy code
/// while the execution thread loads from other addresses. Ordering
/// between a store and a snapshot of the same page is provided by
/// the cache lock, not by this type.
pub struct GuestRam {
    base: u64,
    bytes: Box<[AtomicU8]>,
}

impl GuestRam {
    /// Allocate zeroed RAM. `size` is rounded up to whole pages.
    pub fn new(base: u64, size: usize) -> Self {
        let page = PAGE_SIZE as usize;
        let size = (size + page - 1) & !(page - 1);
        let bytes = (0..size).map(|_| AtomicU8::new(0)).collect();
        Self { base, bytes }
    }

    /// Copy `data` in at `pa`, bypassing code invalidation. For
    /// loading images before execution starts.
    pub fn load(&self, pa: u64, data: &[u8]) -> Result<(), BusError> {
        self.write(pa, data)
    }

    fn index(&self, pa: u64, len: usize) -> Result<usize, BusError> {
        if self.contains(pa, len) {
            Ok((pa - self.base) as usize)
        } else {
            Err(BusError { pa, len })
        }
    }
}

impl PhysMemory for GuestRam {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&self, pa: u64, buf: &mut [u8]) -> Result<(), BusError> {
        let start = self.index(pa, buf.len())?;
        for (dst, src) in buf.iter_mut().zip(&self.bytes[start..]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn write(&self, pa: u64, data: &[u8]) -> Result<(), BusError> {
        let start = self.index(pa, data.len())?;
        for (dst, src) in self.bytes[start..].iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
        Ok(())
    }
}
