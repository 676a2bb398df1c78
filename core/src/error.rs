//! Error taxonomy.
//!
//! - [`GuestFault`]: architectural exceptions. Always routed to the
//!   guest trap handler, never fatal to the host.
//! - [`CompileAbort`]: a compilation attempt that produced nothing.
//!   Dropped silently by the worker; only counted.
//! - [`TcgError`]: host-side setup failures (bad configuration,
//!   arena allocation, worker spawn).
//!
//! Cache exhaustion is handled by LRU eviction and has no error
//! type. Invariant violations go through [`crate::invariant!`].

use std::io;

use thiserror::Error;

use crate::addr::AccessKind;

/// Translation failure reported by the address translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page fault on {kind:?} at {va:#x}")]
pub struct PageFault {
    pub va: u64,
    pub kind: AccessKind,
}

impl PageFault {
    pub fn new(va: u64, kind: AccessKind) -> Self {
        Self { va, kind }
    }

    /// The architectural exception this translation failure raises.
    pub fn to_guest_fault(self) -> GuestFault {
        match self.kind {
            AccessKind::Fetch => GuestFault::InstructionPageFault(self.va),
            AccessKind::Load => GuestFault::LoadPageFault(self.va),
            AccessKind::Store => GuestFault::StorePageFault(self.va),
        }
    }
}

impl From<PageFault> for GuestFault {
    fn from(f: PageFault) -> Self {
        f.to_guest_fault()
    }
}

/// Synchronous guest exception (RISC-V `mcause` < 2^63).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error("instruction address misaligned at {0:#x}")]
    InstructionMisaligned(u64),
    #[error("instruction access fault at {0:#x}")]
    InstructionAccessFault(u64),
    #[error("illegal instruction {0:#010x}")]
    IllegalInstruction(u32),
    #[error("breakpoint at {0:#x}")]
    Breakpoint(u64),
    #[error("load address misaligned at {0:#x}")]
    LoadMisaligned(u64),
    #[error("load access fault at {0:#x}")]
    LoadAccessFault(u64),
    #[error("store address misaligned at {0:#x}")]
    StoreMisaligned(u64),
    #[error("store access fault at {0:#x}")]
    StoreAccessFault(u64),
    #[error("environment call")]
    EnvironmentCall,
    #[error("instruction page fault at {0:#x}")]
    InstructionPageFault(u64),
    #[error("load page fault at {0:#x}")]
    LoadPageFault(u64),
    #[error("store page fault at {0:#x}")]
    StorePageFault(u64),
}

impl GuestFault {
    /// Exception code written to `mcause`.
    pub fn cause(&self) -> u64 {
        match self {
            Self::InstructionMisaligned(_) => 0,
            Self::InstructionAccessFault(_) => 1,
            Self::IllegalInstruction(_) => 2,
            Self::Breakpoint(_) => 3,
            Self::LoadMisaligned(_) => 4,
            Self::LoadAccessFault(_) => 5,
            Self::StoreMisaligned(_) => 6,
            Self::StoreAccessFault(_) => 7,
            Self::EnvironmentCall => 11,
            Self::InstructionPageFault(_) => 12,
            Self::LoadPageFault(_) => 13,
            Self::StorePageFault(_) => 15,
        }
    }

    /// Value written to `mtval`.
    pub fn tval(&self) -> u64 {
        match *self {
            Self::IllegalInstruction(bits) => bits as u64,
            Self::EnvironmentCall => 0,
            Self::InstructionMisaligned(a)
            | Self::InstructionAccessFault(a)
            | Self::Breakpoint(a)
            | Self::LoadMisaligned(a)
            | Self::LoadAccessFault(a)
            | Self::StoreMisaligned(a)
            | Self::StoreAccessFault(a)
            | Self::InstructionPageFault(a)
            | Self::LoadPageFault(a)
            | Self::StorePageFault(a) => a,
        }
    }
}

/// Event handed to the trap-handling collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exception(GuestFault),
    /// Asynchronous interrupt; payload is the interrupt code.
    Interrupt(u64),
}

impl From<GuestFault> for Trap {
    fn from(f: GuestFault) -> Self {
        Trap::Exception(f)
    }
}

/// Reasons a compilation attempt produced no installed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileAbort {
    /// A page the block was read from changed between snapshot and
    /// commit.
    #[error("page {pfn:#x} written during compilation")]
    StaleSnapshot { pfn: u64 },
    /// Another attempt installed a block for the same PA first.
    #[error("block at {pa:#x} already installed")]
    AlreadyInstalled { pa: u64 },
    /// The first instruction could not be fetched or decoded.
    #[error("nothing to compile at {pa:#x}")]
    Empty { pa: u64 },
    /// The block is larger than the whole arena, or every block
    /// that could make room is in use.
    #[error("no room for {needed} bytes of host code")]
    ArenaExhausted { needed: usize },
}

/// Invalid [`crate::TcgConfig`] value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("promotion_threshold must be in 1..=65535, got {0}")]
    PromotionThreshold(u32),
    #[error("safepoint_interval must be at least 1")]
    SafepointInterval,
    #[error("code_arena_size must be at least {min} bytes, got {got}")]
    ArenaTooSmall { min: usize, got: usize },
    #[error("compile_queue_depth must be at least 1")]
    QueueDepth,
    #[error("max_block_insns must be in 1..=4096, got {0}")]
    MaxBlockInsns(u32),
}

/// Host-side engine setup failure.
#[derive(Debug, Error)]
pub enum TcgError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to map code arena: {0}")]
    CodeArena(#[source] io::Error),
    #[error("failed to spawn compile worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}
