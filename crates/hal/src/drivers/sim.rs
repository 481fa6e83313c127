//! In-memory model of the mesh, used when no device is attached and by the
//! engine tests.
//!
//! The simulator is not an instruction-set simulator. It models exactly what
//! the debug server observes through the bus: a sparse byte-addressed memory,
//! the DEBUGSTATUS/DEBUGCMD halt handshake, and a script of "the core ran and
//! halted with this PC" events consumed each time a RUN command is written.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::debug;

use crate::{regs, Driver, MeshError};

struct SimState {
    mem: RefCell<HashMap<u32, u8>>,

    /// Program counters observed at the next halts, per RUN command.
    halt_script: RefCell<VecDeque<u32>>,
}

/// Clones share one simulated mesh, so a test can keep a handle while the
/// `Mesh` owns another.
#[derive(Clone)]
pub struct SimDriver {
    state: Rc<SimState>,
}

impl SimDriver {
    pub fn new() -> SimDriver {
        SimDriver {
            state: Rc::new(SimState {
                mem: RefCell::new(HashMap::new()),
                halt_script: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Arrange for the next RUN command to halt the core with the given PC.
    pub fn push_halt(&self, pc: u32) {
        self.state.halt_script.borrow_mut().push_back(pc);
    }

    fn read_byte(&self, addr: u32) -> u8 {
        *self.state.mem.borrow().get(&addr).unwrap_or(&0)
    }

    fn write_byte(&self, addr: u32, value: u8) {
        self.state.mem.borrow_mut().insert(addr, value);
    }

    fn read_word_raw(&self, addr: u32) -> u32 {
        let mem = self.state.mem.borrow();
        let mut val = 0u32;
        for i in 0..4 {
            val |= u32::from(*mem.get(&(addr + i)).unwrap_or(&0)) << (8 * i);
        }
        val
    }

    fn write_word_raw(&self, addr: u32, value: u32) {
        let mut mem = self.state.mem.borrow_mut();
        for i in 0..4 {
            mem.insert(addr + i, (value >> (8 * i)) as u8);
        }
    }

    fn handle_debugcmd(&self, core_base: u32, value: u32) {
        match value {
            regs::DEBUGCMD_HALT => {
                debug!("sim: HALT core 0x{:08x}", core_base);
                self.write_word_raw(core_base | regs::CORE_DEBUGSTATUS, regs::DEBUGSTATUS_HALT);
            }
            regs::DEBUGCMD_RUN => match self.state.halt_script.borrow_mut().pop_front() {
                Some(pc) => {
                    debug!("sim: RUN core 0x{:08x}, halting at pc 0x{:08x}", core_base, pc);
                    self.write_word_raw(core_base | regs::CORE_PC, pc);
                    self.write_word_raw(
                        core_base | regs::CORE_DEBUGSTATUS,
                        regs::DEBUGSTATUS_HALT,
                    );
                }
                None => {
                    debug!("sim: RUN core 0x{:08x}, no halt scripted", core_base);
                    self.write_word_raw(core_base | regs::CORE_DEBUGSTATUS, 0);
                }
            },
            other => debug!("sim: unknown DEBUGCMD value 0x{:08x}", other),
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        SimDriver::new()
    }
}

impl Driver for SimDriver {
    fn read_word(&self, addr: u32) -> Result<u32, MeshError> {
        Ok(self.read_word_raw(addr))
    }

    fn write_word(&self, addr: u32, value: u32) -> Result<(), MeshError> {
        self.write_word_raw(addr, value);
        if (addr & 0x000f_ffff) == regs::CORE_DEBUGCMD {
            self.handle_debugcmd(addr & 0xfff0_0000, value);
        }
        Ok(())
    }

    fn read_burst(&self, addr: u32, buf: &mut [u8]) -> Result<(), MeshError> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(addr + i as u32);
        }
        Ok(())
    }

    fn write_burst(&self, addr: u32, buf: &[u8]) -> Result<(), MeshError> {
        for (i, b) in buf.iter().enumerate() {
            self.write_byte(addr + i as u32, *b);
        }
        Ok(())
    }

    fn platform_reset(&self) -> Result<(), MeshError> {
        self.state.mem.borrow_mut().clear();
        self.state.halt_script.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let sim = SimDriver::new();
        sim.write_burst(0x100, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(sim.read_word(0x100).unwrap(), 0x4433_2211);
    }

    #[test]
    fn halt_command_sets_debug_status() {
        let sim = SimDriver::new();
        let base = 0x8080_0000;
        sim.write_word(base | regs::CORE_DEBUGCMD, regs::DEBUGCMD_HALT)
            .unwrap();
        assert_eq!(
            sim.read_word(base | regs::CORE_DEBUGSTATUS).unwrap(),
            regs::DEBUGSTATUS_HALT
        );
    }

    #[test]
    fn run_command_consumes_the_halt_script() {
        let sim = SimDriver::new();
        let base = 0x8080_0000;
        sim.push_halt(0x2042);
        sim.write_word(base | regs::CORE_DEBUGCMD, regs::DEBUGCMD_RUN)
            .unwrap();
        assert_eq!(sim.read_word(base | regs::CORE_PC).unwrap(), 0x2042);
        assert_eq!(
            sim.read_word(base | regs::CORE_DEBUGSTATUS).unwrap(),
            regs::DEBUGSTATUS_HALT
        );

        // Script exhausted: the core keeps running.
        sim.write_word(base | regs::CORE_DEBUGCMD, regs::DEBUGCMD_RUN)
            .unwrap();
        assert_eq!(sim.read_word(base | regs::CORE_DEBUGSTATUS).unwrap(), 0);
    }
}
