//! Mapped destination regions.
//!
//! A durable copy only means something when its destination is persistent
//! memory mapped into the address space. These types map either a
//! device-DAX character device or a regular (DAX-capable) file.
#![allow(unsafe_code)]

use nix::fcntl::{OFlag, open};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;

#[allow(clippy::len_without_is_empty)]
pub trait PmemRegion: Send + Sync {
    /// Start of the mapping.
    fn as_ptr(&self) -> *mut u8;
    /// Size of the mapping in bytes.
    fn len(&self) -> usize;
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    // Closed on drop, after the unmap.
    _fd: OwnedFd,
}

impl Mapping {
    unsafe fn new(fd: OwnedFd, len: usize, flags: MapFlags) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping length is zero"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
                &fd,
                0,
            )
        }
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        log::debug!(
            "mapped fd {} at {:p} ({} bytes, {:?})",
            fd.as_raw_fd(),
            ptr.as_ptr(),
            len,
            flags
        );
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            _fd: fd,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let ptr: NonNull<c_void> = self.ptr.cast();
        if let Err(e) = unsafe { munmap(ptr, self.len) } {
            log::warn!("munmap of {:p} failed: {}", self.ptr, e);
        }
    }
}

fn fd_size(fd: &OwnedFd) -> io::Result<usize> {
    let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat_buf) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat_buf.st_size as usize)
}

fn open_rw(path: &Path, flags: OFlag, mode: Mode) -> io::Result<OwnedFd> {
    open(path, flags, mode).map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// A device-DAX character device (e.g. `/dev/dax0.0`) mapped with
/// `MAP_SYNC`.
pub struct DevDaxRegion {
    map: Mapping,
}

// The region is plain memory; synchronising accesses is the caller's job.
unsafe impl Send for DevDaxRegion {}
unsafe impl Sync for DevDaxRegion {}

impl DevDaxRegion {
    /// Map the whole device, sized by `fstat`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The path points to a device-DAX device
    /// - No other process is accessing the device in an incompatible way
    pub unsafe fn open(path: &Path) -> io::Result<Self> {
        let fd = open_rw(path, OFlag::O_RDWR, Mode::empty())?;
        let len = fd_size(&fd)?;
        unsafe { Self::map(fd, len) }
    }

    /// Map the first `len` bytes of the device.
    ///
    /// Character devices often report a zero size, so the length can be
    /// given explicitly.
    ///
    /// # Safety
    ///
    /// Same as [`DevDaxRegion::open`]; `len` must not exceed the device size.
    pub unsafe fn open_len(path: &Path, len: usize) -> io::Result<Self> {
        let fd = open_rw(path, OFlag::O_RDWR, Mode::empty())?;
        unsafe { Self::map(fd, len) }
    }

    unsafe fn map(fd: OwnedFd, len: usize) -> io::Result<Self> {
        // MAP_SYNC: CPU flushes alone make stores durable, no msync needed.
        let flags = MapFlags::from_bits_retain(libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC);
        let map = unsafe { Mapping::new(fd, len, flags)? };
        Ok(Self { map })
    }
}

impl PmemRegion for DevDaxRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.map.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.map.len
    }
}

/// A file mapped with `MAP_SHARED`.
///
/// On a DAX filesystem this is persistent memory; elsewhere it behaves like
/// any shared file mapping and is handy for tests.
pub struct FileRegion {
    map: Mapping,
}

unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}

impl FileRegion {
    /// Create (or truncate to) `len` bytes and map the file.
    ///
    /// # Safety
    ///
    /// The caller must ensure that no other process is accessing the file
    /// in an incompatible way.
    pub unsafe fn create(path: &Path, len: usize) -> io::Result<Self> {
        let fd = open_rw(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let size = i64::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        ftruncate(&fd, size).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let map = unsafe { Mapping::new(fd, len, MapFlags::MAP_SHARED)? };
        Ok(Self { map })
    }

    /// Map an existing file at its current size.
    ///
    /// # Safety
    ///
    /// Same as [`FileRegion::create`].
    pub unsafe fn open(path: &Path) -> io::Result<Self> {
        let fd = open_rw(path, OFlag::O_RDWR, Mode::empty())?;
        let len = fd_size(&fd)?;
        let map = unsafe { Mapping::new(fd, len, MapFlags::MAP_SHARED)? };
        Ok(Self { map })
    }
}

impl PmemRegion for FileRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.map.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.map.len
    }
}
