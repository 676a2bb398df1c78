//! Guest store hook: self-modifying code detection and invalidation.

use tcg_core::{pfn, BusError};

use crate::page_version::PageState;
use crate::SharedState;

/// What a store did to translated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcOutcome {
    /// Compiled blocks removed.
    pub invalidated: usize,
    /// The store hit the frame instructions are fetched from; that
    /// frame is now in SMC state.
    pub same_page: bool,
}

/// Write `data` at `pa` and invalidate what it overwrote.
///
/// Under the cache lock: apply the write, remove every block with
/// code in the written frame(s), reset their hotness, and bump their
/// versions. A write to `fetch_pfn` also moves that frame to
/// [`PageState::SmcDetected`]. The write and the invalidation are
/// one critical section, so no compilation can commit code read
/// before the write.
pub fn guest_store<B>(
    shared: &SharedState<B>,
    pa: u64,
    data: &[u8],
    fetch_pfn: Option<u64>,
) -> Result<SmcOutcome, BusError> {
    let cache = &shared.cache;
    let mut outcome = SmcOutcome::default();
    if data.is_empty() {
        return Ok(outcome);
    }
    let first = pfn(pa);
    let last = pfn(pa + data.len() as u64 - 1);

    let mut st = cache.lock();
    shared.mem.write(pa, data)?;
    for frame in first..=last {
        // Blocks go invalid before the version moves, so a lock-free
        // reader that sees the new version also sees the dead block.
        outcome.invalidated += cache.invalidate(&mut st, frame);
        cache.pages().bump(&st, frame);
        cache.hotness().reset_page(&st, frame);
        if fetch_pfn == Some(frame) {
            cache.pages().set_state(&st, frame, PageState::SmcDetected);
            outcome.same_page = true;
        }
    }
    drop(st);

    if outcome.same_page {
        log::trace!("[tcg-smc] store to executing frame {first:#x}");
    }
    Ok(outcome)
}

/// Leave SMC state for `frame` once fetch has moved elsewhere.
pub fn leave_smc_page<B>(shared: &SharedState<B>, frame: u64) {
    let cache = &shared.cache;
    let st = cache.lock();
    cache.pages().set_state(&st, frame, PageState::Normal);
    log::trace!("[tcg-smc] frame {frame:#x} back to normal");
}
