//! Driver for a memory-mapped device window.
//!
//! The kernel driver exposes the mesh's global address space as a mappable
//! device node; this driver mmaps a window of it and performs volatile word
//! accesses. The same mechanism covers a PCIe BAR resource file when the
//! chip hangs off a PCIe carrier.

use memmap::{MmapMut, MmapOptions};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};

use crate::{Driver, MeshError};

pub struct DevMemDriver {
    path: PathBuf,
    map: RefCell<MmapMut>,

    /// Global address of the first byte of the window.
    base: u32,
}

impl DevMemDriver {
    /// Map `size` bytes of the device starting at global address `base`.
    /// The file must exist and be mappable read-write.
    pub fn new<P: AsRef<Path>>(path: P, base: u32, size: usize) -> Result<DevMemDriver, MeshError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!(
            "mapped {} ({} bytes at global 0x{:08x})",
            path.as_ref().display(),
            size,
            base
        );
        Ok(DevMemDriver {
            path: path.as_ref().to_path_buf(),
            map: RefCell::new(map),
            base,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, MeshError> {
        let map_len = self.map.borrow().len();
        let off = addr.wrapping_sub(self.base) as usize;
        if addr < self.base || off + len > map_len {
            return Err(MeshError::AddressOutOfRange(addr));
        }
        Ok(off)
    }
}

impl Driver for DevMemDriver {
    fn read_word(&self, addr: u32) -> Result<u32, MeshError> {
        let off = self.offset(addr, 4)?;
        let map = self.map.borrow();
        // Volatile: the register file has read side effects and must not be
        // cached or merged by the compiler.
        let val = unsafe { ptr::read_volatile(map.as_ptr().add(off) as *const u32) };
        Ok(val)
    }

    fn write_word(&self, addr: u32, value: u32) -> Result<(), MeshError> {
        let off = self.offset(addr, 4)?;
        let mut map = self.map.borrow_mut();
        unsafe { ptr::write_volatile(map.as_mut_ptr().add(off) as *mut u32, value) };
        Ok(())
    }

    fn read_burst(&self, addr: u32, buf: &mut [u8]) -> Result<(), MeshError> {
        let off = self.offset(addr, buf.len())?;
        let map = self.map.borrow();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(map.as_ptr().add(off + i)) };
        }
        Ok(())
    }

    fn write_burst(&self, addr: u32, buf: &[u8]) -> Result<(), MeshError> {
        let off = self.offset(addr, buf.len())?;
        let mut map = self.map.borrow_mut();
        for (i, b) in buf.iter().enumerate() {
            unsafe { ptr::write_volatile(map.as_mut_ptr().add(off + i), *b) };
        }
        Ok(())
    }

    fn platform_reset(&self) -> Result<(), MeshError> {
        // Board-level reset lines are not reachable through the memory
        // window; the server falls back to per-core software reset.
        warn!("platform reset not available through the memory window: ignored");
        Ok(())
    }
}
