//! RISC-V CPU state for machine-mode execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of general-purpose registers (x0-x31).
pub const NUM_GPRS: usize = 32;

// CSR numbers.
pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MISA: u16 = 0x301;
pub const CSR_MIE: u16 = 0x304;
pub const CSR_MTVEC: u16 = 0x305;
pub const CSR_MSCRATCH: u16 = 0x340;
pub const CSR_MEPC: u16 = 0x341;
pub const CSR_MCAUSE: u16 = 0x342;
pub const CSR_MTVAL: u16 = 0x343;
pub const CSR_MIP: u16 = 0x344;
pub const CSR_MINSTRET: u16 = 0xB02;
pub const CSR_INSTRET: u16 = 0xC02;
pub const CSR_MHARTID: u16 = 0xF14;

/// mstatus.MIE
pub const MSTATUS_MIE: u64 = 1 << 3;
/// mstatus.MPIE
pub const MSTATUS_MPIE: u64 = 1 << 7;
/// mstatus.MPP (always M in this model)
pub const MSTATUS_MPP: u64 = 3 << 11;

/// Interrupt codes (bit numbers in mip/mie).
pub const IRQ_S_SOFT: u64 = 1;
pub const IRQ_M_SOFT: u64 = 3;
pub const IRQ_S_TIMER: u64 = 5;
pub const IRQ_M_TIMER: u64 = 7;
pub const IRQ_S_EXT: u64 = 9;
pub const IRQ_M_EXT: u64 = 11;

/// Order in which simultaneously pending interrupts are taken.
const IRQ_PRIORITY: [u64; 6] =
    [IRQ_M_EXT, IRQ_M_SOFT, IRQ_M_TIMER, IRQ_S_EXT, IRQ_S_SOFT, IRQ_S_TIMER];

/// RV64IC, machine mode.
const MISA_VALUE: u64 = (2 << 62) | (1 << 2) | (1 << 8);

/// Pending-interrupt bits (`mip`), shared with devices.
///
/// Cloning yields another handle to the same line, so a timer or
/// UI thread can raise an interrupt while the CPU is executing.
#[derive(Debug, Clone, Default)]
pub struct InterruptLine {
    mip: Arc<AtomicU64>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, code: u64) {
        self.mip.fetch_or(1 << code, Ordering::Release);
    }

    pub fn lower(&self, code: u64) {
        self.mip.fetch_and(!(1 << code), Ordering::Release);
    }

    pub fn pending(&self) -> u64 {
        self.mip.load(Ordering::Acquire)
    }

    fn store(&self, val: u64) {
        self.mip.store(val, Ordering::Release);
    }
}

/// RISC-V CPU architectural state (RV64, machine mode).
#[derive(Debug, Clone)]
pub struct RiscvCpu {
    /// General-purpose registers x0-x31.
    /// x0 is hardwired to zero (enforced by the semantics,
    /// not by this struct).
    pub gpr: [u64; NUM_GPRS],
    /// Program counter (guest virtual).
    pub pc: u64,
    pub mstatus: u64,
    pub mie: u64,
    pub mtvec: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    /// Retired instruction count (`minstret`).
    pub instret: u64,
    pub hartid: u64,
    pub irq: InterruptLine,
}

impl RiscvCpu {
    pub fn new() -> Self {
        Self {
            gpr: [0u64; NUM_GPRS],
            pc: 0,
            mstatus: MSTATUS_MPP,
            mie: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            instret: 0,
            hartid: 0,
            irq: InterruptLine::new(),
        }
    }

    #[inline]
    pub fn reg(&self, r: u8) -> u64 {
        self.gpr[r as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, r: u8, val: u64) {
        if r != 0 {
            self.gpr[r as usize] = val;
        }
    }

    /// Highest-priority interrupt that is pending, enabled in `mie`
    /// and globally enabled by `mstatus.MIE`.
    pub fn pending_interrupt(&self) -> Option<u64> {
        if self.mstatus & MSTATUS_MIE == 0 {
            return None;
        }
        let armed = self.irq.pending() & self.mie;
        if armed == 0 {
            return None;
        }
        IRQ_PRIORITY.into_iter().find(|&c| armed & (1 << c) != 0)
    }

    /// Read a CSR. `None` for unimplemented CSRs.
    pub fn csr_read(&self, csr: u16) -> Option<u64> {
        let val = match csr {
            CSR_MSTATUS => self.mstatus,
            CSR_MISA => MISA_VALUE,
            CSR_MIE => self.mie,
            CSR_MTVEC => self.mtvec,
            CSR_MSCRATCH => self.mscratch,
            CSR_MEPC => self.mepc,
            CSR_MCAUSE => self.mcause,
            CSR_MTVAL => self.mtval,
            CSR_MIP => self.irq.pending(),
            CSR_MINSTRET | CSR_INSTRET => self.instret,
            CSR_MHARTID => self.hartid,
            _ => return None,
        };
        Some(val)
    }

    /// Write a CSR. `false` for unimplemented or read-only CSRs.
    pub fn csr_write(&mut self, csr: u16, val: u64) -> bool {
        match csr {
            CSR_MSTATUS => {
                self.mstatus =
                    (val & (MSTATUS_MIE | MSTATUS_MPIE)) | MSTATUS_MPP
            }
            // WARL: writes ignored.
            CSR_MISA => {}
            CSR_MIE => self.mie = val,
            // Direct mode only; vectored mode bits are dropped.
            CSR_MTVEC => self.mtvec = val & !0x3,
            CSR_MSCRATCH => self.mscratch = val,
            CSR_MEPC => self.mepc = val & !0x1,
            CSR_MCAUSE => self.mcause = val,
            CSR_MTVAL => self.mtval = val,
            CSR_MIP => self.irq.store(val),
            CSR_MINSTRET => self.instret = val,
            _ => return false,
        }
        true
    }
}

impl Default for RiscvCpu {
    fn default() -> Self {
        Self::new()
    }
}
