//! Host-side access layer for the Epiphany many-core coprocessor.
//!
//! The [`Mesh`] struct is the facade the debug server talks to. It owns a
//! word-granular [`Driver`] for the actual bus transactions and layers the
//! conveniences on top: byte and half-word access synthesized with
//! read-modify-write, chunked bursts, core-local to global address
//! conversion, and the thread-to-core selection used by the RSP `H` packet.

pub mod drivers;
pub mod platform;
pub mod regs;
pub mod shm;

use log::{debug, warn};
use platform::Platform;

use std::cell::Cell;
use std::io;

/// Largest number of words moved in a single driver burst.
const MAX_BURST_WORDS: usize = 256;

#[derive(Debug)]
pub enum MeshError {
    /// The requested address is not in any mapped range
    AddressOutOfRange(u32),

    /// Expected one size, but got another
    LengthError(usize, usize),

    /// std::io error
    IoError(io::Error),

    /// Attempted to communicate with the target, but the driver isn't attached
    NotConnected,

    /// The operation is not available on this driver
    NotSupported,

    /// The driver returned something inconsistent
    WrongResponse,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MeshError::*;
        match self {
            AddressOutOfRange(addr) => {
                write!(f, "address 0x{:08x} is not in a mapped range", addr)
            }
            LengthError(expected, actual) => {
                write!(f, "expected {} bytes, but got {} instead", expected, actual)
            }
            IoError(e) => write!(f, "io error {}", e),
            NotConnected => write!(f, "driver not connected"),
            NotSupported => write!(f, "operation not supported by this driver"),
            WrongResponse => write!(f, "wrong response received"),
        }
    }
}

impl std::convert::From<io::Error> for MeshError {
    fn from(e: io::Error) -> MeshError {
        MeshError::IoError(e)
    }
}

/// The low-level hardware contract: word transactions against the global
/// address map. Everything else is synthesized above this trait.
pub trait Driver {
    fn read_word(&self, addr: u32) -> Result<u32, MeshError>;
    fn write_word(&self, addr: u32, value: u32) -> Result<(), MeshError>;
    fn read_burst(&self, addr: u32, buf: &mut [u8]) -> Result<(), MeshError>;
    fn write_burst(&self, addr: u32, buf: &[u8]) -> Result<(), MeshError>;

    /// Board-level reset.
    fn platform_reset(&self) -> Result<(), MeshError>;

    // VCD trace hooks. Real hardware has nothing to set up, so the
    // primitives default to "available".
    fn init_trace(&self) -> bool {
        true
    }
    fn start_trace(&self) -> bool {
        true
    }
    fn stop_trace(&self) -> bool {
        true
    }
}

/// Facade over one attached mesh of cores.
pub struct Mesh {
    driver: Box<dyn Driver>,
    platform: Platform,

    /// Absolute core ID used to globalize core-local addresses.
    current_core: Cell<u16>,

    /// Thread selections made through the RSP `H` packet.
    thread_general: Cell<i32>,
    thread_execute: Cell<i32>,
}

impl Mesh {
    pub fn new(driver: Box<dyn Driver>, platform: Platform) -> Mesh {
        let first_core = platform.abs_core_id(platform.rel_core_ids()[0]).unwrap();
        Mesh {
            driver,
            platform,
            current_core: Cell::new(first_core),
            thread_general: Cell::new(0),
            thread_execute: Cell::new(0),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Globalize a core-local address against the currently selected core.
    /// Addresses with a non-zero mesh coordinate pass through untouched.
    fn convert_address(&self, addr: u32) -> u32 {
        if addr < 0x0010_0000 {
            (u32::from(self.current_core.get()) << 20) | addr
        } else {
            addr
        }
    }

    fn check_addr(&self, addr: u32, len: usize) -> Result<(), MeshError> {
        let last = addr.wrapping_add(len.saturating_sub(1) as u32);
        if self.platform.is_valid_addr(addr) && self.platform.is_valid_addr(last) {
            Ok(())
        } else {
            warn!("address 0x{:08x} (+{}) is not in a mapped range", addr, len);
            Err(MeshError::AddressOutOfRange(addr))
        }
    }

    pub fn read_word(&self, addr: u32) -> Result<u32, MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 4)?;
        self.driver.read_word(full)
    }

    pub fn write_word(&self, addr: u32, value: u32) -> Result<(), MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 4)?;
        self.driver.write_word(full, value)
    }

    /// Half-word read, synthesized from the aligned word.
    pub fn read_u16(&self, addr: u32) -> Result<u16, MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 2)?;
        let word = self.driver.read_word(full & !0x3)?;
        Ok(((word >> (8 * (full & 2))) & 0xffff) as u16)
    }

    /// Byte read, synthesized from the aligned word.
    pub fn read_u8(&self, addr: u32) -> Result<u8, MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 1)?;
        let word = self.driver.read_word(full & !0x3)?;
        Ok(((word >> (8 * (full & 3))) & 0xff) as u8)
    }

    /// Half-word write: read the aligned word, merge, write it back.
    pub fn write_u16(&self, addr: u32, value: u16) -> Result<(), MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 2)?;
        let aligned = full & !0x3;
        let shift = 8 * (full & 2);
        let word = self.driver.read_word(aligned)?;
        let merged = (word & !(0xffff << shift)) | (u32::from(value) << shift);
        self.driver.write_word(aligned, merged)
    }

    /// Byte write: read the aligned word, merge, write it back.
    pub fn write_u8(&self, addr: u32, value: u8) -> Result<(), MeshError> {
        let full = self.convert_address(addr);
        self.check_addr(full, 1)?;
        let aligned = full & !0x3;
        let shift = 8 * (full & 3);
        let word = self.driver.read_word(aligned)?;
        let merged = (word & !(0xff << shift)) | (u32::from(value) << shift);
        self.driver.write_word(aligned, merged)
    }

    pub fn read_burst(&self, addr: u32, buf: &mut [u8]) -> Result<(), MeshError> {
        if buf.is_empty() {
            return Ok(());
        }
        let full = self.convert_address(addr);
        self.check_addr(full, buf.len())?;

        if full % 4 != 0 {
            // Unaligned reads fall back to byte synthesis.
            for (i, b) in buf.iter_mut().enumerate() {
                let a = full + i as u32;
                let word = self.driver.read_word(a & !0x3)?;
                *b = ((word >> (8 * (a & 3))) & 0xff) as u8;
            }
            return Ok(());
        }

        let chunk = MAX_BURST_WORDS * 4;
        let mut off = 0;
        while off < buf.len() {
            let end = (off + chunk).min(buf.len());
            debug!("burst read 0x{:08x} ({} bytes)", full + off as u32, end - off);
            self.driver.read_burst(full + off as u32, &mut buf[off..end])?;
            off = end;
        }
        Ok(())
    }

    pub fn write_burst(&self, addr: u32, buf: &[u8]) -> Result<(), MeshError> {
        if buf.is_empty() {
            return Ok(());
        }
        let full = self.convert_address(addr);
        self.check_addr(full, buf.len())?;

        if full % 4 != 0 {
            for (i, b) in buf.iter().enumerate() {
                let a = full + i as u32;
                let aligned = a & !0x3;
                let shift = 8 * (a & 3);
                let word = self.driver.read_word(aligned)?;
                let merged = (word & !(0xff << shift)) | (u32::from(*b) << shift);
                self.driver.write_word(aligned, merged)?;
            }
            return Ok(());
        }

        let chunk = MAX_BURST_WORDS * 4;
        let mut off = 0;
        while off < buf.len() {
            let end = (off + chunk).min(buf.len());
            debug!("burst write 0x{:08x} ({} bytes)", full + off as u32, end - off);
            self.driver.write_burst(full + off as u32, &buf[off..end])?;
            off = end;
        }
        Ok(())
    }

    /// All relative core IDs on the platform.
    pub fn list_cores(&self) -> Vec<u16> {
        self.platform.rel_core_ids().to_vec()
    }

    /// Select the core used for general (register/memory) access. Thread IDs
    /// follow the RSP convention: -1 means "all", 0 means "any", otherwise
    /// the relative core ID plus one.
    pub fn set_thread_general(&self, thread_id: i32) -> bool {
        match thread_id {
            -1 => false,
            0 => true,
            id => {
                let rel_id = (id - 1) as u16;
                match self.platform.abs_core_id(rel_id) {
                    None => false,
                    Some(abs) => {
                        self.thread_general.set(id);
                        self.current_core.set(abs);
                        true
                    }
                }
            }
        }
    }

    /// Select the core used for execution control.
    pub fn set_thread_execute(&self, thread_id: i32) -> bool {
        match thread_id {
            -1 | 0 => {
                self.thread_execute.set(thread_id);
                true
            }
            id => {
                let rel_id = (id - 1) as u16;
                if self.platform.abs_core_id(rel_id).is_none() {
                    false
                } else {
                    self.thread_execute.set(id);
                    true
                }
            }
        }
    }

    pub fn current_core(&self) -> u16 {
        self.current_core.get()
    }

    pub fn platform_reset(&self) -> Result<(), MeshError> {
        self.driver.platform_reset()
    }

    pub fn init_trace(&self) -> bool {
        self.driver.init_trace()
    }

    pub fn start_trace(&self) -> bool {
        self.driver.start_trace()
    }

    pub fn stop_trace(&self) -> bool {
        self.driver.stop_trace()
    }
}

#[cfg(test)]
mod tests {
    use super::drivers::SimDriver;
    use super::platform::Platform;
    use super::Mesh;

    fn test_mesh() -> Mesh {
        Mesh::new(Box::new(SimDriver::new()), Platform::single_chip())
    }

    #[test]
    fn local_addresses_follow_the_selected_core() {
        let mesh = test_mesh();
        let base = (32u32 << 26) | (8 << 20);

        mesh.write_word(0x100, 0xdead_beef).unwrap();
        assert_eq!(mesh.read_word(base + 0x100).unwrap(), 0xdead_beef);

        // Select relative core (0,1): thread id is rel + 1.
        assert!(mesh.set_thread_general(2));
        mesh.write_word(0x100, 0x1234_5678).unwrap();
        let base2 = (32u32 << 26) | (9 << 20);
        assert_eq!(mesh.read_word(base2 + 0x100).unwrap(), 0x1234_5678);
    }

    #[test]
    fn sub_word_access_is_read_modify_write() {
        let mesh = test_mesh();
        mesh.write_word(0x200, 0xaabb_ccdd).unwrap();
        mesh.write_u16(0x200, 0x1122).unwrap();
        assert_eq!(mesh.read_word(0x200).unwrap(), 0xaabb_1122);
        mesh.write_u8(0x203, 0xee).unwrap();
        assert_eq!(mesh.read_word(0x200).unwrap(), 0xeebb_1122);
        assert_eq!(mesh.read_u16(0x202).unwrap(), 0xeebb);
        assert_eq!(mesh.read_u8(0x201).unwrap(), 0x11);
    }

    #[test]
    fn bursts_round_trip() {
        let mesh = test_mesh();
        let data: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        mesh.write_burst(0x1000, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        mesh.read_burst(0x1000, &mut back).unwrap();
        assert_eq!(data, back);

        // Unaligned path.
        mesh.write_burst(0x2001, &data[..7]).unwrap();
        let mut back = vec![0u8; 7];
        mesh.read_burst(0x2001, &mut back).unwrap();
        assert_eq!(&data[..7], &back[..]);
    }

    #[test]
    fn unmapped_addresses_are_rejected() {
        let mesh = test_mesh();
        assert!(mesh.read_word(0x2000_0000).is_err());
        assert!(mesh.write_word(0x2000_0000, 0).is_err());
        // A burst that starts valid but runs off the end of core memory.
        let buf = vec![0u8; 0x100];
        assert!(mesh.write_burst(0x7f80, &buf).is_err());
    }

    #[test]
    fn bad_thread_ids_are_rejected() {
        let mesh = test_mesh();
        assert!(!mesh.set_thread_general(-1));
        assert!(mesh.set_thread_general(0));
        assert!(!mesh.set_thread_general(17));
        assert!(mesh.set_thread_execute(-1));
        assert!(!mesh.set_thread_execute(1000));
    }
}
