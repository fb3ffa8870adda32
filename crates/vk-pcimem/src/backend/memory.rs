//! In-memory fake devices
//!
//! Implements [`MapBackend`] over page-aligned heap buffers, one per device
//! path. Behaves like a BAR whose registers are plain memory, which makes it
//! suitable for:
//!
//! 1. **CI without hardware**: every lifecycle and accessor test runs against
//!    it.
//! 2. **Counting OS calls**: [`BackendStats`] records opens, maps, unmaps and
//!    closes so descriptor reuse is observable.
//! 3. **Catching stale pointers**: with [`MemoryBackend::poison_on_unmap`] a
//!    window is overwritten with [`POISON`] when it is unmapped, so a read
//!    through a stale pointer shows up as poison instead of plausible data.
//!
//! The backend is strict where the kernel is: map offsets must be page
//! aligned, windows must lie inside the device, and `unmap` must be called
//! with exactly the address and length `map` returned.

use super::{BackendKind, MapBackend};
use crate::config::MapConfig;
use crate::error::{PciMemError, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Byte written over unmapped windows when poisoning is on
pub const POISON: u8 = 0xA5;

/// Default fake page size
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// OS calls observed by a [`MemoryBackend`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    /// Successful `open` calls
    pub opens: usize,
    /// Successful `map` calls
    pub maps: usize,
    /// Successful `unmap` calls
    pub unmaps: usize,
    /// Successful `close` calls
    pub closes: usize,
}

/// Page-aligned zeroed heap buffer standing in for a BAR
#[derive(Debug)]
struct DeviceMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl DeviceMemory {
    fn new(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|e| PciMemError::os("mmap", io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| PciMemError::os("mmap", io::Error::from_raw_os_error(libc::ENOMEM)))?;
        Ok(Self { ptr, layout })
    }

    const fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated in `new` with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug, Clone, Copy)]
struct MapRecord {
    fd: RawFd,
    len: usize,
}

/// Fake device backend.
///
/// Register devices with [`Self::add_device`], then hand the backend to
/// [`crate::PciMem::with_backend`].
#[derive(Debug)]
pub struct MemoryBackend {
    page_size: u64,
    devices: HashMap<PathBuf, DeviceMemory>,
    fds: HashMap<RawFd, PathBuf>,
    maps: HashMap<usize, MapRecord>,
    next_fd: RawFd,
    poison: bool,
    fail_next_map: Option<i32>,
    stats: BackendStats,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend with 4 KB pages and no devices
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a backend with a custom page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn with_page_size(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            page_size,
            devices: HashMap::new(),
            fds: HashMap::new(),
            maps: HashMap::new(),
            next_fd: 3,
            poison: false,
            fail_next_map: None,
            stats: BackendStats::default(),
        }
    }

    /// Register a zero-filled device of `size` bytes at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the backing allocation fails.
    pub fn add_device(&mut self, path: impl Into<PathBuf>, size: usize) -> Result<()> {
        let align = usize::try_from(self.page_size).unwrap_or(4096);
        let memory = DeviceMemory::new(size, align)?;
        self.devices.insert(path.into(), memory);
        Ok(())
    }

    /// Builder form of [`Self::add_device`]
    ///
    /// # Errors
    ///
    /// Returns an error if the backing allocation fails.
    pub fn device(mut self, path: impl Into<PathBuf>, size: usize) -> Result<Self> {
        self.add_device(path, size)?;
        Ok(self)
    }

    /// Overwrite windows with [`POISON`] when they are unmapped
    #[must_use]
    pub fn poison_on_unmap(mut self, poison: bool) -> Self {
        self.poison = poison;
        self
    }

    /// Make the next `map` fail with `errno`
    pub fn fail_next_map(&mut self, errno: i32) {
        self.fail_next_map = Some(errno);
    }

    /// OS calls observed so far
    #[must_use]
    pub const fn stats(&self) -> BackendStats {
        self.stats
    }

    /// Descriptors currently open
    #[must_use]
    pub fn open_fds(&self) -> usize {
        self.fds.len()
    }

    /// Mappings currently live
    #[must_use]
    pub fn live_maps(&self) -> usize {
        self.maps.len()
    }

    /// Copy `len` bytes of device memory starting at `offset`.
    ///
    /// Returns `None` if the device does not exist or the range is outside it.
    #[must_use]
    pub fn peek(&self, path: impl AsRef<Path>, offset: usize, len: usize) -> Option<Vec<u8>> {
        let device = self.devices.get(path.as_ref())?;
        if offset.checked_add(len)? > device.size() {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: range checked against the allocation above.
        unsafe {
            std::ptr::copy_nonoverlapping(device.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }

    /// Store `data` into device memory at `offset`, as the card would.
    ///
    /// Returns `false` if the device does not exist or the range is outside it.
    pub fn poke(&mut self, path: impl AsRef<Path>, offset: usize, data: &[u8]) -> bool {
        let Some(device) = self.devices.get(path.as_ref()) else {
            return false;
        };
        match offset.checked_add(data.len()) {
            Some(end) if end <= device.size() => {}
            _ => return false,
        }
        // SAFETY: range checked against the allocation above.
        unsafe {
            let dst = device.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        true
    }

    fn device_for_fd(&self, fd: RawFd) -> Result<&DeviceMemory> {
        self.fds
            .get(&fd)
            .and_then(|path| self.devices.get(path))
            .ok_or_else(|| PciMemError::os("mmap", io::Error::from_raw_os_error(libc::EBADF)))
    }
}

impl MapBackend for MemoryBackend {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn open(&mut self, path: &Path, _config: &MapConfig) -> Result<RawFd> {
        if !self.devices.contains_key(path) {
            return Err(PciMemError::os("open", io::Error::from_raw_os_error(libc::ENOENT)));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, path.to_path_buf());
        self.stats.opens += 1;
        tracing::debug!("memory backend: open {} -> fd {fd}", path.display());
        Ok(fd)
    }

    fn map(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: u64,
        _config: &MapConfig,
    ) -> Result<NonNull<u8>> {
        if let Some(errno) = self.fail_next_map.take() {
            return Err(PciMemError::os("mmap", io::Error::from_raw_os_error(errno)));
        }

        let einval = || PciMemError::os("mmap", io::Error::from_raw_os_error(libc::EINVAL));
        if len == 0 || offset % self.page_size != 0 {
            return Err(einval());
        }

        let device = self.device_for_fd(fd)?;
        let start = usize::try_from(offset).map_err(|_| einval())?;
        match start.checked_add(len) {
            Some(end) if end <= device.size() => {}
            _ => return Err(einval()),
        }

        // SAFETY: start + len lies inside the allocation (checked above).
        let addr = unsafe { NonNull::new_unchecked(device.ptr.as_ptr().add(start)) };
        self.maps.insert(addr.as_ptr() as usize, MapRecord { fd, len });
        self.stats.maps += 1;
        Ok(addr)
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<()> {
        let key = addr.as_ptr() as usize;
        match self.maps.get(&key) {
            Some(record) if record.len == len => {}
            _ => return Err(PciMemError::os("munmap", io::Error::from_raw_os_error(libc::EINVAL))),
        }
        let record = self.maps.remove(&key);
        if self.poison {
            // SAFETY: addr/len is a live window inside the device allocation.
            unsafe { std::ptr::write_bytes(addr.as_ptr(), POISON, len) };
        }
        self.stats.unmaps += 1;
        tracing::debug!(
            "memory backend: unmap {len:#x} bytes (fd {})",
            record.map_or(-1, |r| r.fd)
        );
        Ok(())
    }

    fn close(&mut self, fd: RawFd) -> Result<()> {
        if self.fds.remove(&fd).is_none() {
            return Err(PciMemError::os("close", io::Error::from_raw_os_error(libc::EBADF)));
        }
        self.stats.closes += 1;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "/sys/class/misc/bcm-vk.0/pci/resource0";

    #[test]
    fn open_unknown_device_fails() {
        let mut b = MemoryBackend::new();
        let err = b.open(Path::new(DEV), &MapConfig::default()).unwrap_err();
        assert_eq!(err.code(), -libc::ENOENT);
    }

    #[test]
    fn map_requires_page_alignment_and_bounds() {
        let mut b = MemoryBackend::new().device(DEV, 8192).unwrap();
        let cfg = MapConfig::default();
        let fd = b.open(Path::new(DEV), &cfg).unwrap();

        assert!(b.map(fd, 4096, 0x10, &cfg).is_err());
        assert!(b.map(fd, 8192, 4096, &cfg).is_err());
        assert!(b.map(fd, 4096, 4096, &cfg).is_ok());
        assert_eq!(b.stats().maps, 1);
    }

    #[test]
    fn unmap_length_must_match() {
        let mut b = MemoryBackend::new().device(DEV, 8192).unwrap();
        let cfg = MapConfig::default();
        let fd = b.open(Path::new(DEV), &cfg).unwrap();
        let addr = b.map(fd, 8192, 0, &cfg).unwrap();

        // SAFETY: addr came from map above.
        unsafe {
            assert!(b.unmap(addr, 4096).is_err());
            assert!(b.unmap(addr, 8192).is_ok());
        }
        assert_eq!(b.live_maps(), 0);
    }

    #[test]
    fn poison_on_unmap_overwrites_window() {
        let mut b = MemoryBackend::new().device(DEV, 4096).unwrap().poison_on_unmap(true);
        let cfg = MapConfig::default();
        assert!(b.poke(DEV, 0, &[1, 2, 3, 4]));
        let fd = b.open(Path::new(DEV), &cfg).unwrap();
        let addr = b.map(fd, 4096, 0, &cfg).unwrap();

        // SAFETY: addr came from map above.
        unsafe { b.unmap(addr, 4096).unwrap() };
        assert_eq!(b.peek(DEV, 0, 4).unwrap(), vec![POISON; 4]);
    }

    #[test]
    fn injected_map_failure() {
        let mut b = MemoryBackend::new().device(DEV, 4096).unwrap();
        let cfg = MapConfig::default();
        let fd = b.open(Path::new(DEV), &cfg).unwrap();
        b.fail_next_map(libc::ENOMEM);
        assert_eq!(b.map(fd, 4096, 0, &cfg).unwrap_err().code(), -libc::ENOMEM);
        assert!(b.map(fd, 4096, 0, &cfg).is_ok());
    }
}
