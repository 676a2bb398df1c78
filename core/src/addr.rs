//! Guest physical addressing and the address-translator seam.

use crate::error::PageFault;

/// Guest page size shift (4 KiB pages).
pub const PAGE_BITS: u32 = 12;
/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Physical frame number of `pa`.
#[inline]
pub const fn pfn(pa: u64) -> u64 {
    pa >> PAGE_BITS
}

/// Address of the first byte of the page containing `addr`.
#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Kind of access being translated; selects the permission bit
/// checked and the fault raised on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// VA → PA translation with permission check.
///
/// Implemented by the MMU outside the engine. The execution loop
/// calls it for every block entry, for the second half of a
/// page-crossing instruction, and for every data access.
pub trait AddressTranslator {
    fn translate(&self, va: u64, kind: AccessKind) -> Result<u64, PageFault>;
}

/// Identity mapping with every permission granted (bare machine
/// mode, `satp.MODE == Bare`).
#[derive(Debug, Default, Clone, Copy)]
pub struct BareTranslator;

impl AddressTranslator for BareTranslator {
    fn translate(&self, va: u64, _kind: AccessKind) -> Result<u64, PageFault> {
        Ok(va)
    }
}
