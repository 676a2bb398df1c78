//! TCG core: types shared by the translation engine.
//!
//! Guest physical addressing, the compiled-block record and its
//! validity stamp, the compiled-code exit protocol, engine
//! configuration and the error taxonomy. Everything here is
//! independent of the guest ISA and of the host code emitter.

pub mod addr;
pub mod config;
pub mod error;
pub mod memory;
pub mod tb;

pub use addr::{
    page_base, page_offset, pfn, AccessKind, AddressTranslator,
    BareTranslator, PAGE_BITS, PAGE_SIZE,
};
pub use config::TcgConfig;
pub use error::{
    CompileAbort, ConfigError, GuestFault, PageFault, TcgError, Trap,
};
pub use memory::{BusError, GuestRam, PhysMemory};
pub use tb::{
    BlockEnd, BlockExit, CompiledBlock, ExitKind, JumpCache, PageStamp,
    ValidityStamp, TB_JMP_CACHE_SIZE,
};

#[doc(hidden)]
pub use log as __log;

/// Report a broken synchronisation invariant.
///
/// Logs at `error` level and panics in debug builds. In release
/// builds the macro evaluates to `false` so the caller can refuse
/// the operation instead of corrupting guest execution.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {{
        let ok: bool = $cond;
        if !ok {
            $crate::__log::error!("[tcg] invariant violated: {}", format_args!($($arg)+));
            if cfg!(debug_assertions) {
                panic!("invariant violated: {}", format_args!($($arg)+));
            }
        }
        ok
    }};
}
