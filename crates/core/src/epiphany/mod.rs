//! Control of one Epiphany eCore through its memory-mapped debug registers.
//!
//! The controller owns the matchpoint table and the three execution engines:
//! software single-step (transient breakpoints at every possible successor
//! PC), the continue poll loop, and the halt-on-break suspend path. The RSP
//! layer sits above and talks to the target exclusively through this module.

use epiphany_hal::{regs, Mesh, MeshError};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

pub mod exception;
pub mod isa;

use exception::{CoreException, TargetSignal};

bitflags! {
    struct DebugFlags: u32 {
        const HALT = regs::DEBUGSTATUS_HALT;
        const OUT_TRANSACTION = regs::DEBUGSTATUS_OUT_TRANSACTION;
    }
}

/// Period of the continue poll loop.
const POLL_PERIOD: Duration = Duration::from_millis(300);

/// Poll wakeups consumed per continue entry before control returns to the
/// dispatcher to look for a break byte.
const POLL_BUDGET: u32 = 3;

/// How long a halt request may take before the target is declared hung.
const HALT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum CpuError {
    /// The given register number does not exist
    InvalidRegister(u32),

    /// The target bus failed
    Mesh(MeshError),

    /// The target no longer matches the state this server believes it has.
    /// Not recoverable; the server aborts with a diagnostic.
    StateDesync(String),
}

impl std::fmt::Display for CpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CpuError::*;
        match self {
            InvalidRegister(r) => write!(f, "invalid register {}", r),
            Mesh(e) => write!(f, "target bus error: {}", e),
            StateDesync(s) => write!(f, "target state desynchronized: {}", s),
        }
    }
}

impl std::convert::From<MeshError> for CpuError {
    fn from(e: MeshError) -> CpuError {
        CpuError::Mesh(e)
    }
}

/// Matchpoint kinds. The wire protocol numbers soft/hard breakpoints and
/// the three watchpoint flavours 0-4; `Transient` is internal to the step
/// engine and never visible to the client.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum MpKind {
    Memory,
    Hardware,
    WatchWrite,
    WatchRead,
    WatchAccess,
    Transient,
}

impl MpKind {
    pub fn from_str(r: &str) -> Option<MpKind> {
        match r {
            "0" => Some(MpKind::Memory),
            "1" => Some(MpKind::Hardware),
            "2" => Some(MpKind::WatchWrite),
            "3" => Some(MpKind::WatchRead),
            "4" => Some(MpKind::WatchAccess),
            _ => None,
        }
    }
}

/// What the target did after a resume or halt request.
#[derive(Debug, PartialEq)]
pub enum StopEvent {
    /// Still running; the caller should poll again after checking for a
    /// break request.
    Running,

    /// Halted; report the signal to the client.
    Stopped { pc: u32, signal: TargetSignal },

    /// Halted on a semihosting trap; the File-I/O layer takes over.
    Trap { pc: u32, trap: u8 },
}

pub struct EpiphanyCpu {
    /// Live matchpoints, keyed by kind and address, holding the displaced
    /// instruction. Survives client reconnects.
    matchpoints: RefCell<HashMap<(MpKind, u32), u16>>,

    /// Saved copy of the interrupt vector table while the step engine has
    /// breakpoints planted in it.
    ivt_save: RefCell<[u8; (regs::IVT_ENTRIES * regs::IVT_ENTRY_BYTES) as usize]>,
}

impl EpiphanyCpu {
    pub fn new() -> EpiphanyCpu {
        EpiphanyCpu {
            matchpoints: RefCell::new(HashMap::new()),
            ivt_save: RefCell::new([0; (regs::IVT_ENTRIES * regs::IVT_ENTRY_BYTES) as usize]),
        }
    }

    // ------------------------------------------------------------------
    // Register and memory convenience access
    // ------------------------------------------------------------------

    pub fn read_gpr(&self, mesh: &Mesh, regnum: u32) -> Result<u32, CpuError> {
        debug_assert!(regnum < regs::NUM_GPRS);
        Ok(mesh.read_word(regs::CORE_R0 + regnum * 4)?)
    }

    pub fn write_gpr(&self, mesh: &Mesh, regnum: u32, value: u32) -> Result<(), CpuError> {
        debug_assert!(regnum < regs::NUM_GPRS);
        Ok(mesh.write_word(regs::CORE_R0 + regnum * 4, value)?)
    }

    /// Read a register by its GDB number: GPR bank, status bank or DMA bank.
    pub fn read_reg(&self, mesh: &Mesh, regnum: u32) -> Result<u32, CpuError> {
        match regs::reg_addr(regnum) {
            Some(addr) => Ok(mesh.read_word(addr)?),
            None => Err(CpuError::InvalidRegister(regnum)),
        }
    }

    pub fn write_reg(&self, mesh: &Mesh, regnum: u32, value: u32) -> Result<(), CpuError> {
        match regs::reg_addr(regnum) {
            Some(addr) => Ok(mesh.write_word(addr, value)?),
            None => Err(CpuError::InvalidRegister(regnum)),
        }
    }

    /// All registers of a `g` dump: the GPR bank in one burst, then the
    /// status bank.
    pub fn read_all_regs(&self, mesh: &Mesh) -> Result<Vec<u32>, CpuError> {
        let mut buf = [0u8; (regs::NUM_GPRS * 4) as usize];
        mesh.read_burst(regs::CORE_R0, &mut buf)?;

        let mut values = Vec::with_capacity(regs::NUM_REGS as usize);
        for chunk in buf.chunks_exact(4) {
            values.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        for offset in &regs::STATUS_REGS {
            values.push(mesh.read_word(*offset)?);
        }
        Ok(values)
    }

    pub fn read_pc(&self, mesh: &Mesh) -> Result<u32, CpuError> {
        Ok(mesh.read_word(regs::CORE_PC)?)
    }

    pub fn write_pc(&self, mesh: &Mesh, addr: u32) -> Result<(), CpuError> {
        Ok(mesh.write_word(regs::CORE_PC, addr)?)
    }

    pub fn read_status(&self, mesh: &Mesh) -> Result<u32, CpuError> {
        Ok(mesh.read_word(regs::CORE_STATUS)?)
    }

    pub fn read_core_id(&self, mesh: &Mesh) -> Result<u32, CpuError> {
        Ok(mesh.read_word(regs::CORE_COREID)?)
    }

    // ------------------------------------------------------------------
    // Halt state
    // ------------------------------------------------------------------

    fn debug_flags(&self, mesh: &Mesh) -> Result<DebugFlags, CpuError> {
        Ok(DebugFlags::from_bits_truncate(
            mesh.read_word(regs::CORE_DEBUGSTATUS)?,
        ))
    }

    /// The core is stopped in debug mode: halted with no outstanding
    /// external transaction.
    pub fn in_debug_state(&self, mesh: &Mesh) -> Result<bool, CpuError> {
        let flags = self.debug_flags(mesh)?;
        Ok(flags.contains(DebugFlags::HALT) && !flags.contains(DebugFlags::OUT_TRANSACTION))
    }

    fn is_idle(&self, mesh: &Mesh) -> Result<bool, CpuError> {
        Ok(self.read_status(mesh)? & regs::STATUS_ACTIVE == 0)
    }

    fn interrupts_enabled(&self, mesh: &Mesh) -> Result<bool, CpuError> {
        Ok(self.read_status(mesh)? & regs::STATUS_GID == 0)
    }

    fn pending_interrupts(&self, mesh: &Mesh) -> Result<u32, CpuError> {
        let imask = mesh.read_word(regs::CORE_IMASK)?;
        let ilat = mesh.read_word(regs::CORE_ILAT)?;
        Ok(!imask & ilat)
    }

    pub fn exception(&self, mesh: &Mesh) -> Result<CoreException, CpuError> {
        Ok(CoreException::from_status(self.read_status(mesh)?))
    }

    /// Halt the target by command and wait for it to stop.
    pub fn halt(&self, mesh: &Mesh) -> Result<bool, CpuError> {
        mesh.write_word(regs::CORE_DEBUGCMD, regs::DEBUGCMD_HALT)?;

        let deadline = Instant::now() + HALT_TIMEOUT;
        while !self.in_debug_state(mesh)? {
            if Instant::now() >= deadline {
                let val = mesh.read_word(regs::CORE_DEBUGSTATUS)?;
                warn!(
                    "target has not halted after {:?} (DEBUGSTATUS = 0x{:08x})",
                    HALT_TIMEOUT, val
                );
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(10));
        }
        debug!("target halted");
        Ok(true)
    }

    /// Take the core out of debug mode.
    pub fn resume(&self, mesh: &Mesh) -> Result<(), CpuError> {
        mesh.write_word(regs::CORE_DEBUGCMD, regs::DEBUGCMD_RUN)?;
        debug!("target resumed");
        Ok(())
    }

    fn wait_halt(&self, mesh: &Mesh) -> Result<(), CpuError> {
        while !self.in_debug_state(mesh)? {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Software reset: pulse the reset register, mirroring what the loader
    /// does.
    pub fn sw_reset(&self, mesh: &Mesh) -> Result<(), CpuError> {
        for _ in 0..12 {
            mesh.write_word(regs::CORE_RESETCORE, 1)?;
        }
        mesh.write_word(regs::CORE_RESETCORE, 0)?;
        Ok(())
    }

    /// Kick a stopped core by raising the sync interrupt.
    pub fn start_run(&self, mesh: &Mesh) -> Result<(), CpuError> {
        Ok(mesh.write_word(regs::CORE_ILAT, regs::ILAT_SYNC)?)
    }

    // ------------------------------------------------------------------
    // Matchpoints
    // ------------------------------------------------------------------

    fn put_bkpt(&self, mesh: &Mesh, addr: u32) -> Result<(), CpuError> {
        debug!("put breakpoint instruction at 0x{:08x}", addr);
        Ok(mesh.write_u16(addr, isa::BKPT_INSTR)?)
    }

    fn is_bkpt_at(&self, mesh: &Mesh, addr: u32) -> Result<bool, CpuError> {
        Ok(mesh.read_u16(addr)? == isa::BKPT_INSTR)
    }

    /// Insert a client-visible software breakpoint.
    pub fn insert_breakpoint(&self, mesh: &Mesh, addr: u32) -> Result<(), CpuError> {
        let mut mps = self.matchpoints.borrow_mut();
        if !mps.contains_key(&(MpKind::Memory, addr)) {
            let instr = mesh.read_u16(addr)?;
            mps.insert((MpKind::Memory, addr), instr);
        }
        drop(mps);
        self.put_bkpt(mesh, addr)
    }

    /// Remove a software breakpoint. Removing one that was never inserted
    /// is not an error; the client may retry.
    pub fn remove_breakpoint(&self, mesh: &Mesh, addr: u32) -> Result<(), CpuError> {
        if let Some(instr) = self.matchpoints.borrow_mut().remove(&(MpKind::Memory, addr)) {
            mesh.write_u16(addr, instr)?;
        }
        Ok(())
    }

    fn has_matchpoint(&self, kind: MpKind, addr: u32) -> bool {
        self.matchpoints.borrow().contains_key(&(kind, addr))
    }

    /// Plant a step-transient breakpoint unless the address already carries
    /// one (ours or the client's). Records the address in `planted`.
    fn plant_transient(
        &self,
        mesh: &Mesh,
        addr: u32,
        planted: &mut Vec<u32>,
    ) -> Result<(), CpuError> {
        if self.has_matchpoint(MpKind::Memory, addr)
            || self.has_matchpoint(MpKind::Transient, addr)
        {
            return Ok(());
        }
        let instr = mesh.read_u16(addr)?;
        self.matchpoints
            .borrow_mut()
            .insert((MpKind::Transient, addr), instr);
        planted.push(addr);
        self.put_bkpt(mesh, addr)
    }

    /// Restore every transient planted during this step. A transient that
    /// went missing means the target and this server disagree about memory.
    fn clear_transients(&self, mesh: &Mesh, planted: &[u32]) -> Result<(), CpuError> {
        for addr in planted {
            match self
                .matchpoints
                .borrow_mut()
                .remove(&(MpKind::Transient, *addr))
            {
                Some(instr) => mesh.write_u16(*addr, instr)?,
                None => {
                    return Err(CpuError::StateDesync(format!(
                        "transient breakpoint at 0x{:08x} vanished during step cleanup",
                        addr
                    )))
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // IVT shadowing
    // ------------------------------------------------------------------

    /// Save the whole interrupt vector table before planting breakpoints in
    /// it; a fired interrupt would otherwise escape the step.
    fn save_ivt(&self, mesh: &Mesh) -> Result<(), CpuError> {
        Ok(mesh.read_burst(0, &mut *self.ivt_save.borrow_mut())?)
    }

    fn restore_ivt(&self, mesh: &Mesh) -> Result<(), CpuError> {
        Ok(mesh.write_burst(0, &*self.ivt_save.borrow())?)
    }

    /// Plant breakpoints in every IVT entry except the reset vector,
    /// leaving the current PC alone.
    fn plant_ivt_bkpts(&self, mesh: &Mesh, pc: u32) -> Result<(), CpuError> {
        for entry in 1..regs::IVT_ENTRIES {
            let addr = entry * regs::IVT_ENTRY_BYTES;
            if addr != pc {
                self.put_bkpt(mesh, addr)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step engine
    // ------------------------------------------------------------------

    /// Where control flow diverges to, if this instruction can jump.
    fn flow_target(
        &self,
        mesh: &Mesh,
        pc: u32,
        instr: u16,
        ext: u16,
        is32: bool,
        next_seq: u32,
    ) -> Result<u32, CpuError> {
        if isa::is_branch(instr) {
            let disp = isa::branch_displacement(instr, if is32 { Some(ext) } else { None });
            return Ok(pc.wrapping_add((disp << 1) as u32));
        }
        if isa::is_rti(instr) {
            return Ok(mesh.read_word(regs::CORE_IRET)?);
        }
        if let Some(reg) = isa::short_jump_reg(instr) {
            return self.read_gpr(mesh, u32::from(reg));
        }
        if let Some(reg) = isa::long_jump_reg(instr, ext) {
            return self.read_gpr(mesh, u32::from(reg));
        }
        Ok(next_seq)
    }

    /// Single step: plant transient breakpoints at every possible successor
    /// of the current instruction, run, and put everything back.
    pub fn step(&self, mesh: &Mesh, addr: Option<u32>) -> Result<StopEvent, CpuError> {
        if !self.in_debug_state(mesh)? {
            return Err(CpuError::StateDesync(
                "step requested while the target is not halted".to_string(),
            ));
        }

        let pc = self.read_pc(mesh)?;
        let addr = addr.unwrap_or(pc);

        // A latched exception cannot be stepped over; report it instead.
        if let Some(signal) = self.exception(mesh)?.signal() {
            return Ok(StopEvent::Stopped { pc, signal });
        }

        let instr = mesh.read_u16(addr)?;

        if isa::is_idle(instr) {
            return self.step_idle(mesh, addr);
        }

        if isa::is_trap(instr) {
            // Hand the semihosting request to the File-I/O layer and leave
            // the PC past the trap for the eventual resume.
            let trap = isa::trap_number(instr);
            self.write_pc(mesh, addr + isa::TRAP_INSTLEN)?;
            return Ok(StopEvent::Trap { pc: addr, trap });
        }

        self.write_pc(mesh, addr)?;
        let pc = self.read_pc(mesh)?;
        if pc != addr {
            return Err(CpuError::StateDesync(format!(
                "PC readback mismatch: wrote 0x{:08x}, read 0x{:08x}",
                addr, pc
            )));
        }

        let instr = mesh.read_u16(pc)?;
        let ext = mesh.read_u16(pc.wrapping_add(2))?;
        let is32 = isa::is_32bit(instr);

        let next_seq = pc.wrapping_add(if is32 { 4 } else { 2 });
        let next_flow = self.flow_target(mesh, pc, instr, ext, is32, next_seq)?;

        debug!(
            "step at 0x{:08x}: opcode 0x{:04x}, successors 0x{:08x} / 0x{:08x}",
            pc, instr, next_seq, next_flow
        );

        let mut planted = Vec::new();
        self.plant_transient(mesh, next_seq, &mut planted)?;
        if next_flow != next_seq {
            self.plant_transient(mesh, next_flow, &mut planted)?;
        }

        // If an interrupt can fire during the step it would land in the IVT
        // and run away; shadow the table with breakpoints.
        let irq_possible =
            self.interrupts_enabled(mesh)? && self.pending_interrupts(mesh)? != 0;
        if irq_possible {
            self.save_ivt(mesh)?;
            self.plant_ivt_bkpts(mesh, pc)?;
        }

        self.resume(mesh)?;
        self.wait_halt(mesh)?;

        if irq_possible {
            self.restore_ivt(mesh)?;
        }

        // The core halts with the PC past the breakpoint instruction.
        let prev_pc = self.read_pc(mesh)?.wrapping_sub(isa::BKPT_INSTLEN);

        // We must have stopped on something we know about.
        if !self.has_matchpoint(MpKind::Transient, prev_pc)
            && !self.has_matchpoint(MpKind::Memory, prev_pc)
            && !self.is_bkpt_at(mesh, next_flow)?
        {
            return Err(CpuError::StateDesync(format!(
                "halted at 0x{:08x} with no breakpoint to account for it",
                prev_pc
            )));
        }

        self.write_pc(mesh, prev_pc)?;
        self.clear_transients(mesh, &planted)?;

        Ok(StopEvent::Stopped {
            pc: prev_pc,
            signal: TargetSignal::Trap,
        })
    }

    /// Stepping an IDLE only makes progress if an interrupt is pending; the
    /// step then lands in the service routine. Otherwise the core stays put.
    fn step_idle(&self, mesh: &Mesh, addr: u32) -> Result<StopEvent, CpuError> {
        info!("step at IDLE, address 0x{:08x}", addr);

        if self.interrupts_enabled(mesh)? && self.pending_interrupts(mesh)? != 0 {
            self.save_ivt(mesh)?;
            self.plant_ivt_bkpts(mesh, addr)?;
            self.resume(mesh)?;
            self.wait_halt(mesh)?;
            self.restore_ivt(mesh)?;
        }

        let pc = self.read_pc(mesh)?.wrapping_sub(isa::BKPT_INSTLEN);
        self.write_pc(mesh, pc)?;
        Ok(StopEvent::Stopped {
            pc,
            signal: TargetSignal::Trap,
        })
    }

    // ------------------------------------------------------------------
    // Continue engine
    // ------------------------------------------------------------------

    /// One entry of the continue poll loop. Sleeps through at most
    /// `POLL_BUDGET` periods so the caller can look for a break request in
    /// between, then classifies the halt if one happened.
    pub fn poll_halt(&self, mesh: &Mesh) -> Result<StopEvent, CpuError> {
        for _ in 0..POLL_BUDGET {
            thread::sleep(POLL_PERIOD);
            if self.in_debug_state(mesh)? {
                return self.classify_halt(mesh);
            }
        }
        Ok(StopEvent::Running)
    }

    /// Work out why the target stopped during a continue.
    fn classify_halt(&self, mesh: &Mesh) -> Result<StopEvent, CpuError> {
        let c_pc = self.read_pc(mesh)?;
        let prev_pc = c_pc.wrapping_sub(isa::BKPT_INSTLEN);
        let mut instr = mesh.read_u16(prev_pc)?;

        if isa::is_bkpt(instr) {
            if self.has_matchpoint(MpKind::Memory, prev_pc) {
                self.write_pc(mesh, prev_pc)?;
                debug!("breakpoint hit, pc set back to 0x{:08x}", prev_pc);
            }
            return Ok(StopEvent::Stopped {
                pc: prev_pc,
                signal: TargetSignal::Trap,
            });
        }

        let mut stopped_at_trap = isa::is_trap(instr);

        if !stopped_at_trap && isa::is_nop(instr) {
            // The compiler pads traps with NOPs and the halt can overshoot;
            // look back a few instructions for the trap we missed.
            debug!("missed trap, scanning backward from 0x{:08x}", c_pc);
            let limit = prev_pc.saturating_sub(20);
            let mut j = prev_pc.wrapping_sub(2);
            while j > limit {
                let candidate = mesh.read_u16(j)?;
                if isa::is_trap(candidate) {
                    debug!("trap found at 0x{:08x}", j);
                    instr = candidate;
                    stopped_at_trap = true;
                    break;
                }
                j = j.wrapping_sub(2);
            }
        }

        if stopped_at_trap {
            return Ok(StopEvent::Trap {
                pc: prev_pc,
                trap: isa::trap_number(instr),
            });
        }

        // A halt we cannot explain; report it and let the client decide.
        debug!("no trap found, returning control at pc 0x{:08x}", c_pc);
        Ok(StopEvent::Stopped {
            pc: c_pc,
            signal: TargetSignal::Trap,
        })
    }

    // ------------------------------------------------------------------
    // Suspend
    // ------------------------------------------------------------------

    /// Break requested by the client: force the target into debug mode and
    /// report why it stopped.
    pub fn suspend(&self, mesh: &Mesh) -> Result<StopEvent, CpuError> {
        let halted = if self.in_debug_state(mesh)? {
            true
        } else {
            self.halt(mesh)?
        };

        if !halted {
            return Ok(StopEvent::Stopped {
                pc: 0,
                signal: TargetSignal::Hup,
            });
        }

        let mut pc = self.read_pc(mesh)?;

        if let Some(signal) = self.exception(mesh)?.signal() {
            return Ok(StopEvent::Stopped { pc, signal });
        }

        if self.is_idle(mesh)? {
            // Undo the fetch advance, unless we are sitting exactly on the
            // IDLE instruction.
            let instr = mesh.read_u16(pc)?;
            if !isa::is_idle(instr) {
                pc = pc.wrapping_sub(2);
            }
            self.write_pc(mesh, pc)?;
        }

        Ok(StopEvent::Stopped {
            pc,
            signal: TargetSignal::Trap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epiphany_hal::drivers::SimDriver;
    use epiphany_hal::platform::Platform;

    fn setup() -> (SimDriver, Mesh, EpiphanyCpu) {
        let sim = SimDriver::new();
        let mesh = Mesh::new(Box::new(sim.clone()), Platform::single_chip());
        // Start halted with the core active and interrupts disabled.
        mesh.write_word(regs::CORE_DEBUGSTATUS, regs::DEBUGSTATUS_HALT)
            .unwrap();
        mesh.write_word(regs::CORE_STATUS, regs::STATUS_ACTIVE | regs::STATUS_GID)
            .unwrap();
        (sim, mesh, EpiphanyCpu::new())
    }

    #[test]
    fn breakpoint_round_trip_leaves_memory_unchanged() {
        let (_sim, mesh, cpu) = setup();
        mesh.write_u16(0x100, 0x1234).unwrap();

        cpu.insert_breakpoint(&mesh, 0x100).unwrap();
        assert_eq!(mesh.read_u16(0x100).unwrap(), isa::BKPT_INSTR);

        cpu.remove_breakpoint(&mesh, 0x100).unwrap();
        assert_eq!(mesh.read_u16(0x100).unwrap(), 0x1234);

        // Removing again is idempotent.
        cpu.remove_breakpoint(&mesh, 0x100).unwrap();
        assert_eq!(mesh.read_u16(0x100).unwrap(), 0x1234);
    }

    #[test]
    fn duplicate_insert_keeps_the_original_instruction() {
        let (_sim, mesh, cpu) = setup();
        mesh.write_u16(0x180, 0x5678).unwrap();
        cpu.insert_breakpoint(&mesh, 0x180).unwrap();
        cpu.insert_breakpoint(&mesh, 0x180).unwrap();
        cpu.remove_breakpoint(&mesh, 0x180).unwrap();
        assert_eq!(mesh.read_u16(0x180).unwrap(), 0x5678);
    }

    #[test]
    fn step_across_a_taken_branch() {
        let (sim, mesh, cpu) = setup();

        // PC = 0x200, a short branch with displacement +4 half-words.
        mesh.write_word(regs::CORE_PC, 0x200).unwrap();
        mesh.write_u16(0x200, 0x0410).unwrap();
        mesh.write_u16(0x202, 0x1111).unwrap();
        mesh.write_u16(0x208, 0x2222).unwrap();

        // The target takes the branch and halts on the breakpoint at the
        // target address.
        sim.push_halt(0x208 + 2);

        let ev = cpu.step(&mesh, None).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0x208,
                signal: TargetSignal::Trap
            }
        );

        // The PC was rewound to the instruction boundary and both transient
        // breakpoints were cleaned out of memory and out of the table.
        assert_eq!(mesh.read_word(regs::CORE_PC).unwrap(), 0x208);
        assert_eq!(mesh.read_u16(0x202).unwrap(), 0x1111);
        assert_eq!(mesh.read_u16(0x208).unwrap(), 0x2222);
        assert!(cpu.matchpoints.borrow().is_empty());
    }

    #[test]
    fn step_preserves_user_breakpoints() {
        let (sim, mesh, cpu) = setup();

        mesh.write_word(regs::CORE_PC, 0x300).unwrap();
        mesh.write_u16(0x300, isa::NOP_INSTR).unwrap();
        mesh.write_u16(0x302, 0x3333).unwrap();

        // A user breakpoint already sits on the fall-through address.
        cpu.insert_breakpoint(&mesh, 0x302).unwrap();
        sim.push_halt(0x302 + 2);

        let ev = cpu.step(&mesh, None).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0x302,
                signal: TargetSignal::Trap
            }
        );

        // The user breakpoint is retained, in memory and in the table.
        assert_eq!(mesh.read_u16(0x302).unwrap(), isa::BKPT_INSTR);
        assert!(cpu.has_matchpoint(MpKind::Memory, 0x302));
        assert_eq!(cpu.matchpoints.borrow().len(), 1);

        cpu.remove_breakpoint(&mesh, 0x302).unwrap();
        assert_eq!(mesh.read_u16(0x302).unwrap(), 0x3333);
    }

    #[test]
    fn step_at_idle_without_pending_interrupts_stops_immediately() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_word(regs::CORE_PC, 0x400).unwrap();
        mesh.write_u16(0x400, isa::IDLE_INSTR).unwrap();
        // Interrupts disabled; nothing pending. No halt is scripted, so a
        // resume would hang the test: the engine must not resume.
        let ev = cpu.step(&mesh, None).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0x3fe,
                signal: TargetSignal::Trap
            }
        );
    }

    #[test]
    fn step_at_trap_defers_to_file_io() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_word(regs::CORE_PC, 0x500).unwrap();
        // TRAP with trap number 0 (write).
        mesh.write_u16(0x500, isa::TRAP_INSTR).unwrap();

        let ev = cpu.step(&mesh, None).unwrap();
        assert_eq!(ev, StopEvent::Trap { pc: 0x500, trap: 0 });
        // The PC has moved past the trap for the eventual resume.
        assert_eq!(mesh.read_word(regs::CORE_PC).unwrap(), 0x502);
    }

    #[test]
    fn step_with_latched_exception_reports_the_signal() {
        let (_sim, mesh, cpu) = setup();
        mesh.write_word(regs::CORE_PC, 0x600).unwrap();
        mesh.write_word(
            regs::CORE_STATUS,
            regs::STATUS_ACTIVE | regs::STATUS_GID | (0x3 << 16),
        )
        .unwrap();

        let ev = cpu.step(&mesh, None).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0x600,
                signal: TargetSignal::Fpe
            }
        );
    }

    #[test]
    fn continue_halt_on_breakpoint_rewinds_the_pc() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_u16(0x700, 0x4444).unwrap();
        cpu.insert_breakpoint(&mesh, 0x700).unwrap();

        // The target hit the breakpoint: halted with the PC past it.
        mesh.write_word(regs::CORE_PC, 0x702).unwrap();

        let ev = cpu.classify_halt(&mesh).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0x700,
                signal: TargetSignal::Trap
            }
        );
        assert_eq!(mesh.read_word(regs::CORE_PC).unwrap(), 0x700);
    }

    #[test]
    fn continue_halt_on_trap_is_redirected() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_u16(0x800, isa::TRAP_INSTR | (2 << 10)).unwrap();
        mesh.write_word(regs::CORE_PC, 0x802).unwrap();

        let ev = cpu.classify_halt(&mesh).unwrap();
        assert_eq!(ev, StopEvent::Trap { pc: 0x800, trap: 2 });
    }

    #[test]
    fn continue_halt_finds_a_trap_behind_nop_padding() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_u16(0x900, isa::TRAP_INSTR | (1 << 10)).unwrap();
        mesh.write_u16(0x902, isa::NOP_INSTR).unwrap();
        mesh.write_u16(0x904, isa::NOP_INSTR).unwrap();
        mesh.write_word(regs::CORE_PC, 0x906).unwrap();

        let ev = cpu.classify_halt(&mesh).unwrap();
        assert_eq!(ev, StopEvent::Trap { pc: 0x904, trap: 1 });
    }

    #[test]
    fn spurious_halt_reports_the_current_pc() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_u16(0xa00, 0x5555).unwrap();
        mesh.write_word(regs::CORE_PC, 0xa02).unwrap();

        let ev = cpu.classify_halt(&mesh).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0xa02,
                signal: TargetSignal::Trap
            }
        );
    }

    #[test]
    fn suspend_halts_a_running_target() {
        let (_sim, mesh, cpu) = setup();

        // Target running.
        mesh.write_word(regs::CORE_DEBUGSTATUS, 0).unwrap();
        mesh.write_word(regs::CORE_PC, 0xb00).unwrap();

        let ev = cpu.suspend(&mesh).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0xb00,
                signal: TargetSignal::Trap
            }
        );
        assert!(cpu.in_debug_state(&mesh).unwrap());
    }

    #[test]
    fn suspend_maps_exceptions_to_signals() {
        let (_sim, mesh, cpu) = setup();

        mesh.write_word(regs::CORE_PC, 0xc00).unwrap();
        mesh.write_word(
            regs::CORE_STATUS,
            regs::STATUS_ACTIVE | regs::STATUS_GID | (0x2 << 16),
        )
        .unwrap();

        let ev = cpu.suspend(&mesh).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0xc00,
                signal: TargetSignal::Bus
            }
        );
    }

    #[test]
    fn suspend_of_an_idle_core_undoes_the_fetch_advance() {
        let (_sim, mesh, cpu) = setup();

        // Idle core: ACTIVE clear. The PC has advanced past the IDLE.
        mesh.write_word(regs::CORE_STATUS, regs::STATUS_GID).unwrap();
        mesh.write_u16(0xd00, isa::IDLE_INSTR).unwrap();
        mesh.write_word(regs::CORE_PC, 0xd02).unwrap();

        let ev = cpu.suspend(&mesh).unwrap();
        assert_eq!(
            ev,
            StopEvent::Stopped {
                pc: 0xd00,
                signal: TargetSignal::Trap
            }
        );
        assert_eq!(mesh.read_word(regs::CORE_PC).unwrap(), 0xd00);
    }
}
