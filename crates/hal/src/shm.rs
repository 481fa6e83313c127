//! Cross-process shared-memory manager.
//!
//! The kernel driver reserves one contiguous physically-backed region and
//! initializes an allocation table at its base; the heap follows the table.
//! Host processes map the region and coordinate through the table, using a
//! named POSIX semaphore for mutual exclusion. The table layout is shared
//! with the kernel driver and the on-target runtime, so it is byte-exact:
//! packed fields, 8-byte aligned records.
//!
//! The manager is an ordinary owned resource: [`ShmManager::init`] creates
//! it, every operation takes it explicitly, and [`ShmManager::finalize`]
//! tears it down. The semaphore is never held across anything that can
//! block on the target bus.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;

use log::{debug, warn};

pub const SHM_MAGIC: u32 = 0x2718_2818;
pub const MAX_SHM_REGIONS: usize = 64;
pub const SHM_LOCK_NAME: &str = "/eshmlock";
pub const EPIPHANY_DEV: &str = "/dev/epiphany";

/// Shared memory segment descriptor, as seen by every participant.
#[repr(C, packed)]
pub struct ShmSegment {
    /// Virtual address in the mapping process. Only meaningful to whoever
    /// wrote it.
    pub virt_addr: u64,
    pub name: [u8; 256],
    pub size: u64,
    /// Physical address as seen from the coprocessor.
    pub phys_addr: u64,
    /// Offset from the start of the table.
    pub offset: u64,
}

#[repr(C, packed)]
pub struct ShmRegion {
    pub segment: ShmSegment,
    /// Host-side attachment count.
    pub refcnt: u32,
    /// 1 while the region is owned by the table.
    pub valid: u32,
}

#[repr(C, packed)]
pub struct ShmTable {
    pub magic: u32,
    pub padding: u32,
    pub regions: [ShmRegion; MAX_SHM_REGIONS],
    /// Bytes remaining in the heap.
    pub free_space: u32,
    /// Bump offset of the next allocation, relative to the heap base.
    pub next_free_offset: u64,
    pub paddr_epi: u64,
    pub paddr_cpu: u64,
    pub heap: u64,
    pub lock: u64,
}

/// Size of the table rounded to its 8-byte alignment; the heap starts here.
const fn table_size() -> usize {
    (mem::size_of::<ShmTable>() + 7) & !7
}

/// Argument block of the GETSHM driver control call.
#[repr(C)]
#[derive(Default)]
struct GlobalShmAlloc {
    size: u64,
    flags: u64,
    bus_addr: u64,
    phys_addr: u64,
    kvirt_addr: u64,
    uvirt_addr: u64,
    mmap_handle: u64,
}

const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    // _IOC(_IOC_READ | _IOC_WRITE, ty, nr, size)
    ((3u32 << 30) | ((size as u32 & 0x3fff) << 16) | ((ty as u32) << 8) | nr as u32)
        as libc::c_ulong
}

fn getshm_request() -> libc::c_ulong {
    iowr(b'e', 0x05, mem::size_of::<GlobalShmAlloc>())
}

#[derive(Debug)]
pub enum ShmError {
    /// A name or size that can never be satisfied
    InvalidArgument,

    /// A valid region with that name already exists
    AlreadyExists(String),

    /// No valid region with that name
    NotFound(String),

    /// The heap cannot satisfy the request, even after compaction
    OutOfMemory(u64 /* requested */, u32 /* free */),

    /// The region table was not initialized by the driver
    BadMagic(u32 /* found */),

    /// Generic IO error
    IoError(io::Error),

    /// The named semaphore failed
    SemaphoreError(io::Error),
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ShmError::*;
        match self {
            InvalidArgument => write!(f, "invalid name or size"),
            AlreadyExists(n) => write!(f, "region \"{}\" already exists", n),
            NotFound(n) => write!(f, "no region named \"{}\"", n),
            OutOfMemory(want, have) => {
                write!(f, "requested {} bytes but only {} are free", want, have)
            }
            BadMagic(found) => write!(
                f,
                "bad shm magic: expected 0x{:08x}, found 0x{:08x}",
                SHM_MAGIC, found
            ),
            IoError(e) => write!(f, "io error: {}", e),
            SemaphoreError(e) => write!(f, "semaphore error: {}", e),
        }
    }
}

impl std::convert::From<io::Error> for ShmError {
    fn from(e: io::Error) -> ShmError {
        ShmError::IoError(e)
    }
}

/// Host-visible copy of a segment descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub phys_addr: u64,
}

struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

impl NamedSemaphore {
    fn open(name: &str) -> Result<NamedSemaphore, ShmError> {
        let cname = CString::new(name).map_err(|_| ShmError::InvalidArgument)?;
        // Created unlocked, owner read/write only.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::SemaphoreError(io::Error::last_os_error()));
        }
        Ok(NamedSemaphore { sem, name: cname })
    }

    fn wait(&self) -> Result<(), ShmError> {
        if unsafe { libc::sem_wait(self.sem) } != 0 {
            return Err(ShmError::SemaphoreError(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn post(&self) -> Result<(), ShmError> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(ShmError::SemaphoreError(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn unlink(&self) {
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

pub struct ShmManager {
    base: *mut u8,
    len: usize,
    sem: NamedSemaphore,
}

impl ShmManager {
    /// Open the driver device, discover the shared region with the GETSHM
    /// control call, map it and attach.
    pub fn init() -> Result<ShmManager, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(EPIPHANY_DEV)?;

        let mut alloc = GlobalShmAlloc::default();
        if unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                getshm_request(),
                &mut alloc as *mut GlobalShmAlloc,
            )
        } != 0
        {
            return Err(ShmError::IoError(io::Error::last_os_error()));
        }

        let len = alloc.size as usize;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                alloc.mmap_handle as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ShmError::IoError(io::Error::last_os_error()));
        }
        debug!(
            "mapped global shm: handle 0x{:08x}, size 0x{:08x}",
            alloc.mmap_handle, alloc.size
        );

        ShmManager::attach_mapping(base as *mut u8, len, SHM_LOCK_NAME)
    }

    /// Attach to an already-mapped region. The table magic must have been
    /// stamped by the driver (or by [`ShmManager::format`]).
    fn attach_mapping(base: *mut u8, len: usize, lock_name: &str) -> Result<ShmManager, ShmError> {
        if len <= table_size() {
            return Err(ShmError::InvalidArgument);
        }

        let magic = unsafe { ptr::addr_of!((*(base as *const ShmTable)).magic).read_unaligned() };
        if magic != SHM_MAGIC {
            warn!("bad shm magic: expected 0x{:08x} found 0x{:08x}", SHM_MAGIC, magic);
            return Err(ShmError::BadMagic(magic));
        }

        let sem = NamedSemaphore::open(lock_name)?;
        let mgr = ShmManager { base, len, sem };

        // Record our view of the heap and lock, as the driver expects.
        unsafe {
            let t = mgr.table();
            ptr::addr_of_mut!((*t).heap).write_unaligned(base as u64 + table_size() as u64);
            ptr::addr_of_mut!((*t).lock).write_unaligned(mgr.sem.sem as u64);
        }

        debug!("shm manager attached: {} byte heap", mgr.heap_capacity());
        Ok(mgr)
    }

    /// Map an anonymous region of `len` bytes and attach to it under a
    /// caller-chosen lock name. Used for self-tests and loopback setups
    /// where no driver is present; the region is formatted first.
    pub fn init_anonymous(len: usize, lock_name: &str) -> Result<ShmManager, ShmError> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ShmError::IoError(io::Error::last_os_error()));
        }
        unsafe { ShmManager::format(base as *mut u8, len, 0, 0) };
        ShmManager::attach_mapping(base as *mut u8, len, lock_name)
    }

    /// Initialize a raw region the way the kernel driver does: magic, empty
    /// region table, full heap.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `len` writable bytes.
    pub unsafe fn format(base: *mut u8, len: usize, paddr_epi: u64, paddr_cpu: u64) {
        assert!(len > table_size());
        ptr::write_bytes(base, 0, table_size());
        let t = base as *mut ShmTable;
        ptr::addr_of_mut!((*t).magic).write_unaligned(SHM_MAGIC);
        ptr::addr_of_mut!((*t).free_space).write_unaligned((len - table_size()) as u32);
        ptr::addr_of_mut!((*t).next_free_offset).write_unaligned(0);
        ptr::addr_of_mut!((*t).paddr_epi).write_unaligned(paddr_epi);
        ptr::addr_of_mut!((*t).paddr_cpu).write_unaligned(paddr_cpu);
    }

    fn table(&self) -> *mut ShmTable {
        self.base as *mut ShmTable
    }

    fn heap_capacity(&self) -> u64 {
        (self.len - table_size()) as u64
    }

    pub fn free_space(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.table()).free_space).read_unaligned() }
    }

    unsafe fn region(&self, i: usize) -> *mut ShmRegion {
        ptr::addr_of_mut!((*self.table()).regions[i])
    }

    unsafe fn region_name_matches(&self, i: usize, name: &str) -> bool {
        let r = self.region(i);
        let name_ptr = ptr::addr_of!((*r).segment.name) as *const u8;
        let bytes = name.as_bytes();
        if bytes.len() >= 256 {
            return false;
        }
        for (k, b) in bytes.iter().enumerate() {
            if name_ptr.add(k).read() != *b {
                return false;
            }
        }
        name_ptr.add(bytes.len()).read() == 0
    }

    /// Find the slot of a valid region by name. The caller must hold the
    /// semaphore.
    fn lookup(&self, name: &str) -> Option<usize> {
        for i in 0..MAX_SHM_REGIONS {
            unsafe {
                if ptr::addr_of!((*self.region(i)).valid).read_unaligned() == 1
                    && self.region_name_matches(i, name)
                {
                    return Some(i);
                }
            }
        }
        None
    }

    unsafe fn segment_copy(&self, i: usize) -> Segment {
        let r = self.region(i);
        let name_ptr = ptr::addr_of!((*r).segment.name) as *const u8;
        let mut name = Vec::new();
        for k in 0..256 {
            let b = name_ptr.add(k).read();
            if b == 0 {
                break;
            }
            name.push(b);
        }
        Segment {
            name: String::from_utf8_lossy(&name).into_owned(),
            offset: ptr::addr_of!((*r).segment.offset).read_unaligned(),
            size: ptr::addr_of!((*r).segment.size).read_unaligned(),
            phys_addr: ptr::addr_of!((*r).segment.phys_addr).read_unaligned(),
        }
    }

    /// Allocate a named region from the heap.
    pub fn alloc(&self, name: &str, size: u64) -> Result<Segment, ShmError> {
        if name.is_empty() || name.len() >= 256 || size == 0 {
            return Err(ShmError::InvalidArgument);
        }

        self.sem.wait()?;
        let result = self.alloc_locked(name, size);
        self.sem.post()?;
        result
    }

    fn alloc_locked(&self, name: &str, size: u64) -> Result<Segment, ShmError> {
        if self.lookup(name).is_some() {
            return Err(ShmError::AlreadyExists(name.to_owned()));
        }

        unsafe {
            let t = self.table();

            if size > u64::from(ptr::addr_of!((*t).free_space).read_unaligned()) {
                self.compact_heap();
                let free = ptr::addr_of!((*t).free_space).read_unaligned();
                if size > u64::from(free) {
                    return Err(ShmError::OutOfMemory(size, free));
                }
            }

            // Tombstones below the bump point can leave the tail short even
            // when enough total space is free.
            let next = ptr::addr_of!((*t).next_free_offset).read_unaligned();
            if next + size > self.heap_capacity() {
                self.compact_heap();
            }

            let slot = (0..MAX_SHM_REGIONS).find(|&i| {
                ptr::addr_of!((*self.region(i)).valid).read_unaligned() == 0
            });
            let slot = match slot {
                Some(s) => s,
                None => {
                    return Err(ShmError::OutOfMemory(
                        size,
                        ptr::addr_of!((*t).free_space).read_unaligned(),
                    ))
                }
            };

            let next = ptr::addr_of!((*t).next_free_offset).read_unaligned();
            let offset = table_size() as u64 + next;
            let r = self.region(slot);

            let name_dst = ptr::addr_of_mut!((*r).segment.name) as *mut u8;
            ptr::write_bytes(name_dst, 0, 256);
            ptr::copy_nonoverlapping(name.as_ptr(), name_dst, name.len());

            ptr::addr_of_mut!((*r).segment.offset).write_unaligned(offset);
            ptr::addr_of_mut!((*r).segment.virt_addr)
                .write_unaligned(self.base as u64 + offset);
            ptr::addr_of_mut!((*r).segment.phys_addr).write_unaligned(
                ptr::addr_of!((*t).paddr_epi).read_unaligned() + offset,
            );
            ptr::addr_of_mut!((*r).segment.size).write_unaligned(size);
            ptr::addr_of_mut!((*r).refcnt).write_unaligned(1);
            ptr::addr_of_mut!((*r).valid).write_unaligned(1);

            let free = ptr::addr_of!((*t).free_space).read_unaligned();
            ptr::addr_of_mut!((*t).free_space).write_unaligned(free - size as u32);
            ptr::addr_of_mut!((*t).next_free_offset).write_unaligned(next + size);

            debug!(
                "allocated shm region \"{}\": offset 0x{:08x}, size 0x{:08x}",
                name, offset, size
            );

            Ok(self.segment_copy(slot))
        }
    }

    /// Attach to an existing region, bumping its reference count.
    pub fn attach(&self, name: &str) -> Result<Segment, ShmError> {
        self.sem.wait()?;
        let result = match self.lookup(name) {
            None => Err(ShmError::NotFound(name.to_owned())),
            Some(i) => unsafe {
                let r = self.region(i);
                let refcnt = ptr::addr_of!((*r).refcnt).read_unaligned();
                ptr::addr_of_mut!((*r).refcnt).write_unaligned(refcnt + 1);
                Ok(self.segment_copy(i))
            },
        };
        self.sem.post()?;
        result
    }

    /// Drop one reference; the last release returns the space to the heap.
    pub fn release(&self, name: &str) -> Result<(), ShmError> {
        self.sem.wait()?;
        let result = match self.lookup(name) {
            None => Err(ShmError::NotFound(name.to_owned())),
            Some(i) => unsafe {
                let r = self.region(i);
                let refcnt = ptr::addr_of!((*r).refcnt).read_unaligned() - 1;
                ptr::addr_of_mut!((*r).refcnt).write_unaligned(refcnt);
                if refcnt == 0 {
                    let t = self.table();
                    let size = ptr::addr_of!((*r).segment.size).read_unaligned();
                    let free = ptr::addr_of!((*t).free_space).read_unaligned();
                    ptr::addr_of_mut!((*t).free_space).write_unaligned(free + size as u32);
                    ptr::addr_of_mut!((*r).valid).write_unaligned(0);
                    debug!("released shm region \"{}\" ({} bytes back)", name, size);
                }
                Ok(())
            },
        };
        self.sem.post()?;
        result
    }

    /// Current host attachment count of a region.
    pub fn refcount(&self, name: &str) -> Option<u32> {
        self.sem.wait().ok()?;
        let r = self
            .lookup(name)
            .map(|i| unsafe { ptr::addr_of!((*self.region(i)).refcnt).read_unaligned() });
        self.sem.post().ok()?;
        r
    }

    /// Slide every valid region down over the tombstones left by released
    /// regions, rewriting offsets and addresses, and rebuild the free
    /// accounting. The caller must hold the semaphore.
    fn compact_heap(&self) {
        unsafe {
            let t = self.table();

            let mut live: Vec<(usize, u64, u64)> = (0..MAX_SHM_REGIONS)
                .filter(|&i| ptr::addr_of!((*self.region(i)).valid).read_unaligned() == 1)
                .map(|i| {
                    let r = self.region(i);
                    (
                        i,
                        ptr::addr_of!((*r).segment.offset).read_unaligned(),
                        ptr::addr_of!((*r).segment.size).read_unaligned(),
                    )
                })
                .collect();
            live.sort_by_key(|&(_, offset, _)| offset);

            let mut target = table_size() as u64;
            let mut used = 0u64;
            for (i, offset, size) in live {
                if offset != target {
                    // Moving down over a gap; ranges may overlap.
                    ptr::copy(
                        self.base.add(offset as usize),
                        self.base.add(target as usize),
                        size as usize,
                    );
                    let r = self.region(i);
                    ptr::addr_of_mut!((*r).segment.offset).write_unaligned(target);
                    ptr::addr_of_mut!((*r).segment.virt_addr)
                        .write_unaligned(self.base as u64 + target);
                    ptr::addr_of_mut!((*r).segment.phys_addr).write_unaligned(
                        ptr::addr_of!((*t).paddr_epi).read_unaligned() + target,
                    );
                }
                target += size;
                used += size;
            }

            ptr::addr_of_mut!((*t).next_free_offset)
                .write_unaligned(target - table_size() as u64);
            ptr::addr_of_mut!((*t).free_space)
                .write_unaligned((self.heap_capacity() - used) as u32);

            debug!("compacted shm heap: {} bytes in use", used);
        }
    }

    /// Copy data into an allocated region.
    pub fn write_bytes(&self, seg: &Segment, off: u64, data: &[u8]) -> Result<(), ShmError> {
        if off + data.len() as u64 > seg.size {
            return Err(ShmError::InvalidArgument);
        }
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add((seg.offset + off) as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy data out of an allocated region.
    pub fn read_bytes(&self, seg: &Segment, off: u64, buf: &mut [u8]) -> Result<(), ShmError> {
        if off + buf.len() as u64 > seg.size {
            return Err(ShmError::InvalidArgument);
        }
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.add((seg.offset + off) as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Unlink the semaphore and unmap the region.
    pub fn finalize(self) {
        self.sem.unlink();
        // Drop closes the semaphore and unmaps.
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(tag: &str) -> ShmManager {
        let name = format!("/eshm-test-{}-{}", std::process::id(), tag);
        ShmManager::init_anonymous(64 * 1024, &name).unwrap()
    }

    #[test]
    fn table_layout_is_byte_exact() {
        assert_eq!(mem::size_of::<ShmSegment>(), 288);
        assert_eq!(mem::size_of::<ShmRegion>(), 296);
        assert_eq!(
            mem::size_of::<ShmTable>(),
            8 + 296 * MAX_SHM_REGIONS + 4 + 8 * 5
        );
        assert_eq!(table_size() % 8, 0);
    }

    #[test]
    fn alloc_attach_release_lifecycle() {
        let mgr = test_manager("lifecycle");
        let initial = mgr.free_space();

        let seg = mgr.alloc("r", 1024).unwrap();
        assert_eq!(seg.size, 1024);
        assert_eq!(mgr.refcount("r"), Some(1));
        assert_eq!(mgr.free_space(), initial - 1024);

        // A second participant attaches.
        let seg2 = mgr.attach("r").unwrap();
        assert_eq!(seg2, seg);
        assert_eq!(mgr.refcount("r"), Some(2));

        mgr.release("r").unwrap();
        assert_eq!(mgr.refcount("r"), Some(1));
        assert_eq!(mgr.free_space(), initial - 1024);

        mgr.release("r").unwrap();
        assert_eq!(mgr.refcount("r"), None);
        assert_eq!(mgr.free_space(), initial);

        mgr.finalize();
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mgr = test_manager("dup");
        mgr.alloc("twice", 64).unwrap();
        match mgr.alloc("twice", 64) {
            Err(ShmError::AlreadyExists(n)) => assert_eq!(n, "twice"),
            other => panic!("expected AlreadyExists, got {:?}", other.map(|s| s.name)),
        }
        mgr.finalize();
    }

    #[test]
    fn attach_of_unknown_region_fails() {
        let mgr = test_manager("unknown");
        assert!(matches!(mgr.attach("nope"), Err(ShmError::NotFound(_))));
        assert!(matches!(mgr.release("nope"), Err(ShmError::NotFound(_))));
        mgr.finalize();
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mgr = test_manager("oom");
        let free = u64::from(mgr.free_space());
        assert!(matches!(
            mgr.alloc("big", free + 1),
            Err(ShmError::OutOfMemory(_, _))
        ));
        mgr.finalize();
    }

    #[test]
    fn compaction_recovers_tombstones_and_preserves_data() {
        let mgr = test_manager("compact");
        let free = u64::from(mgr.free_space());
        let third = free / 3;

        let _a = mgr.alloc("a", third).unwrap();
        let b = mgr.alloc("b", third).unwrap();
        let c = mgr.alloc("c", free - 2 * third).unwrap();

        let pattern: Vec<u8> = (0..64).map(|i| i as u8 ^ 0x5a).collect();
        mgr.write_bytes(&c, 0, &pattern).unwrap();

        // Free the middle region; the heap is now fragmented and the bump
        // pointer still sits at the top.
        drop(b);
        mgr.release("b").unwrap();
        assert_eq!(mgr.free_space() as u64, third);

        // Only compaction can make room for this.
        let d = mgr.alloc("d", third).unwrap();
        assert_eq!(d.size, third);
        assert_eq!(mgr.free_space(), 0);

        // "c" slid down but kept its contents, and the descriptor moved
        // with it.
        let c = mgr.attach("c").unwrap();
        let mut back = vec![0u8; pattern.len()];
        mgr.read_bytes(&c, 0, &mut back).unwrap();
        assert_eq!(back, pattern);
        assert_eq!(c.offset, table_size() as u64 + third);

        mgr.finalize();
    }

    #[test]
    fn free_space_never_exceeds_heap_capacity() {
        let mgr = test_manager("invariant");
        let cap = mgr.free_space();
        for round in 0..4 {
            let name = format!("seg{}", round);
            mgr.alloc(&name, 512).unwrap();
            mgr.release(&name).unwrap();
            assert_eq!(mgr.free_space(), cap);
        }
        mgr.finalize();
    }
}
