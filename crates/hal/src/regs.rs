//! Memory-mapped register file of a single eCore.
//!
//! Every register on the Epiphany is accessed through the memory map: each
//! core reserves the `0xf0000..0xf1000` window of its local address space for
//! the register file. All constants here are byte offsets from the core base,
//! so `core_base | CORE_PC` is the program counter of that core.

/// Base of the general-purpose register bank (R0..R63, one word each).
pub const CORE_R0: u32 = 0x000f_0000;

/// Number of general purpose registers.
pub const NUM_GPRS: u32 = 64;

// Special core registers.
pub const CORE_CONFIG: u32 = 0x000f_0400;
pub const CORE_STATUS: u32 = 0x000f_0404;
pub const CORE_PC: u32 = 0x000f_0408;
pub const CORE_DEBUGSTATUS: u32 = 0x000f_040c;
pub const CORE_IRET: u32 = 0x000f_0420;
pub const CORE_IMASK: u32 = 0x000f_0424;
pub const CORE_ILAT: u32 = 0x000f_0428;
pub const CORE_IPEND: u32 = 0x000f_0434;
pub const CORE_FSTATUS: u32 = 0x000f_0440;
pub const CORE_DEBUGCMD: u32 = 0x000f_0448;

// Mesh-node registers.
pub const CORE_COREID: u32 = 0x000f_0704;
pub const CORE_RESETCORE: u32 = 0x000f_070c;

/// Base of the DMA register bank. The two channels are contiguous, eight
/// words each.
pub const DMA0_CONFIG: u32 = 0x000f_0500;
pub const NUM_DMA_REGS: u32 = 16;

/// The eight status registers reported in a `g` register dump, in order:
/// CONFIG, STATUS, PC, DEBUGSTATUS, IRET, IMASK, ILAT, IPEND.
pub const STATUS_REGS: [u32; 8] = [
    CORE_CONFIG,
    CORE_STATUS,
    CORE_PC,
    CORE_DEBUGSTATUS,
    CORE_IRET,
    CORE_IMASK,
    CORE_ILAT,
    CORE_IPEND,
];

/// Number of status registers in a full register dump.
pub const NUM_STATUS_REGS: u32 = STATUS_REGS.len() as u32;

/// Total register count visible to a `g`/`G` packet.
pub const NUM_REGS: u32 = NUM_GPRS + NUM_STATUS_REGS;

/// Values written to DEBUGCMD to stop and start the core.
pub const DEBUGCMD_HALT: u32 = 1;
pub const DEBUGCMD_RUN: u32 = 0;

/// DEBUGSTATUS bit 0: the core is halted.
pub const DEBUGSTATUS_HALT: u32 = 1;
/// DEBUGSTATUS bit 1: an external transaction is still outstanding.
pub const DEBUGSTATUS_OUT_TRANSACTION: u32 = 1 << 1;

/// STATUS bit 0: the core is active (clear when idle).
pub const STATUS_ACTIVE: u32 = 1;
/// STATUS bit 1: global interrupt disable.
pub const STATUS_GID: u32 = 1 << 1;
/// STATUS bits 18:16 carry the last exception cause.
pub const STATUS_EXCAUSE_SHIFT: u32 = 16;
pub const STATUS_EXCAUSE_MASK: u32 = 0x7;

/// ILAT bit 0 raises the sync (reset) interrupt.
pub const ILAT_SYNC: u32 = 1;

/// Geometry of the interrupt vector table at the bottom of core memory.
pub const IVT_ENTRIES: u32 = 16;
pub const IVT_ENTRY_BYTES: u32 = 4;

/// Map a GDB register number onto a core-local byte offset.
///
/// The numbering follows the register dump: GPRs first, then the status
/// bank, then the DMA bank.
pub fn reg_addr(regnum: u32) -> Option<u32> {
    if regnum < NUM_GPRS {
        Some(CORE_R0 + regnum * 4)
    } else if regnum < NUM_REGS {
        Some(STATUS_REGS[(regnum - NUM_GPRS) as usize])
    } else if regnum < NUM_REGS + NUM_DMA_REGS {
        Some(DMA0_CONFIG + (regnum - NUM_REGS) * 4)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_offsets() {
        assert_eq!(reg_addr(0), Some(CORE_R0));
        assert_eq!(reg_addr(13), Some(CORE_R0 + 13 * 4));
        assert_eq!(reg_addr(63), Some(CORE_R0 + 63 * 4));
    }

    #[test]
    fn status_bank_offsets() {
        assert_eq!(reg_addr(64), Some(CORE_CONFIG));
        assert_eq!(reg_addr(66), Some(CORE_PC));
        assert_eq!(reg_addr(71), Some(CORE_IPEND));
    }

    #[test]
    fn dma_bank_offsets() {
        assert_eq!(reg_addr(72), Some(DMA0_CONFIG));
        assert_eq!(reg_addr(87), Some(DMA0_CONFIG + 15 * 4));
        assert_eq!(reg_addr(88), None);
    }
}
