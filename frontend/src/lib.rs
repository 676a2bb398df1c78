//! TCG Frontend: guest instruction decoding and semantics.
//!
//! The translation engine treats the guest ISA as a collaborator:
//! it asks the frontend how long an instruction is, decodes it,
//! classifies how it ends a basic block, and executes it against a
//! [`Bus`]. Both the interpreter and compiled code go through the
//! same semantics, so the two tiers cannot disagree on results.

pub mod riscv;

use tcg_core::GuestFault;

/// Guest data access port used by instruction semantics.
///
/// Addresses are guest virtual; the implementation translates,
/// checks permissions and routes stores through code invalidation.
/// `size` is 1, 2, 4 or 8 and the access is naturally aligned.
pub trait Bus {
    fn load(&mut self, va: u64, size: u8) -> Result<u64, GuestFault>;

    fn store(&mut self, va: u64, size: u8, val: u64) -> Result<(), GuestFault>;
}
