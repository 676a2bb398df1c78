//! Fixed-capacity code arena and its extent allocator.

use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::ptr;

/// Allocation granularity in bytes.
pub const ARENA_ALIGN: usize = 16;

/// Host code storage backed by mmap'd memory.
///
/// The arena never grows: when it is full the translation cache
/// evicts blocks to make room. Extent bookkeeping lives in
/// [`ArenaAllocator`], owned by the cache under its lock; the arena
/// itself only copies bytes in and hands slices out.
pub struct CodeArena {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the arena owns its mapping exclusively. Concurrent access is
// limited to reads of installed extents and writes to freshly
// allocated ones, see `write`.
unsafe impl Send for CodeArena {}
unsafe impl Sync for CodeArena {}

impl CodeArena {
    /// Map an arena of `size` bytes (rounded up to the host page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        log::info!("[tcg-cache] code arena mapped: {} KiB", size / 1024);
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Copy `data` into the arena at `offset`.
    ///
    /// # Safety
    ///
    /// `offset..offset + data.len()` must be an extent currently
    /// allocated to the caller that no installed block refers to, so
    /// no thread can be reading it through [`code`](Self::code).
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.size,
            "code arena overflow"
        );
        ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
    }

    /// Host code stored at `range`.
    ///
    /// Callers hold a reference to the block owning `range`, which
    /// keeps the extent from being reallocated.
    pub fn code(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end && range.end <= self.size);
        // SAFETY: in bounds; the extent is not written while a block
        // referencing it is alive.
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(range.start), range.len())
        }
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// First-fit extent allocator over `0..capacity`.
///
/// Free extents are kept sorted by offset and merged with their
/// neighbours on free, so releasing every block restores one
/// extent covering the whole arena.
#[derive(Debug)]
pub struct ArenaAllocator {
    capacity: usize,
    /// offset -> length of each free extent.
    free: BTreeMap<usize, usize>,
    free_bytes: usize,
}

impl ArenaAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity & !(ARENA_ALIGN - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            free_bytes: capacity,
        }
    }

    /// Bytes an allocation of `size` actually occupies.
    #[inline]
    pub fn rounded(size: usize) -> usize {
        (size.max(1) + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Number of disjoint free extents.
    pub fn fragments(&self) -> usize {
        self.free.len()
    }

    /// Whether `alloc(size)` would succeed.
    pub fn can_fit(&self, size: usize) -> bool {
        let need = Self::rounded(size);
        self.free.values().any(|&len| len >= need)
    }

    /// Allocate `size` bytes from the lowest free extent large enough.
    pub fn alloc(&mut self, size: usize) -> Option<Range<usize>> {
        let need = Self::rounded(size);
        let (&off, &len) = self.free.iter().find(|&(_, &len)| len >= need)?;
        self.free.remove(&off);
        if len > need {
            self.free.insert(off + need, len - need);
        }
        self.free_bytes -= need;
        Some(off..off + need)
    }

    /// Return an extent previously handed out by [`alloc`](Self::alloc).
    pub fn free(&mut self, range: Range<usize>) {
        let mut off = range.start;
        let mut len = range.len();
        debug_assert!(off % ARENA_ALIGN == 0 && len % ARENA_ALIGN == 0);
        debug_assert!(range.end <= self.capacity);
        self.free_bytes += len;

        if let Some((&prev_off, &prev_len)) = self.free.range(..off).next_back() {
            debug_assert!(prev_off + prev_len <= off, "double free");
            if prev_off + prev_len == off {
                self.free.remove(&prev_off);
                off = prev_off;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(off + len)) {
            len += next_len;
        }
        self.free.insert(off, len);
    }
}
