//! Real device files
//!
//! `open` goes through `std::fs::OpenOptions`, `mmap`/`munmap` through
//! rustix. `close` uses libc because it is the only way to observe a failing
//! close; dropping an `OwnedFd` discards the error.
//!
//! Interrupted calls (`EINTR`) are retried; every other failure is returned
//! as is.

use super::{BackendKind, MapBackend};
use crate::config::MapConfig;
use crate::error::{PciMemError, Result};
use rustix::fd::BorrowedFd;
use rustix::fs::OFlags;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

/// Backend over the real sysfs resource files
#[derive(Debug, Clone, Copy)]
pub struct SysBackend {
    page_size: u64,
}

impl SysBackend {
    /// Create a backend using the system page size
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: rustix::param::page_size() as u64,
        }
    }
}

impl Default for SysBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MapBackend for SysBackend {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn open(&mut self, path: &Path, config: &MapConfig) -> Result<RawFd> {
        // OFlags bits are small positive values
        #[allow(clippy::cast_possible_wrap)]
        let flags = if config.sync_open {
            OFlags::SYNC.bits() as i32
        } else {
            0
        };

        loop {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(flags)
                .open(path)
            {
                Ok(file) => {
                    let fd = file.into_raw_fd();
                    tracing::info!("Opened {} (fd {fd})", path.display());
                    return Ok(fd);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("open {} failed: {e}", path.display());
                    return Err(PciMemError::os("open", e));
                }
            }
        }
    }

    fn map(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: u64,
        config: &MapConfig,
    ) -> Result<NonNull<u8>> {
        let mut flags = MapFlags::SHARED;
        if config.locked {
            flags |= MapFlags::LOCKED;
        }
        if config.no_reserve {
            flags |= MapFlags::NORESERVE;
        }

        // SAFETY: fd came from `open` on this backend and stays open while any
        // MappingInfo refers to it (reference counted by the registry).
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        loop {
            // SAFETY: a fresh mapping with a null hint cannot alias existing
            // Rust memory; length and offset are validated by the kernel.
            let result = unsafe {
                mmap(
                    std::ptr::null_mut(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    flags,
                    borrowed,
                    offset,
                )
            };
            match result {
                Ok(addr) => {
                    return NonNull::new(addr.cast::<u8>())
                        .ok_or_else(|| PciMemError::os("mmap", Errno::FAULT));
                }
                Err(Errno::INTR) => continue,
                Err(e) => return Err(PciMemError::os("mmap", e)),
            }
        }
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<()> {
        loop {
            // SAFETY: caller guarantees addr/len describe a live mapping from `map`.
            match unsafe { munmap(addr.as_ptr().cast(), len) } {
                Ok(()) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(e) => return Err(PciMemError::os("munmap", e)),
            }
        }
    }

    fn close(&mut self, fd: RawFd) -> Result<()> {
        // SAFETY: fd came from `open` and its last user is releasing it; it is
        // not used again. EINTR is not retried: Linux frees the descriptor
        // before reporting it.
        let rc = unsafe { libc::close(fd) };
        if rc < 0 {
            return Err(PciMemError::os("close", std::io::Error::last_os_error()));
        }
        tracing::debug!("Closed fd {fd}");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let backend = SysBackend::new();
        assert!(backend.page_size().is_power_of_two());
    }

    #[test]
    fn open_missing_device_reports_errno() {
        let mut backend = SysBackend::new();
        let err = backend
            .open(
                Path::new("/sys/class/misc/bcm-vk.99/pci/resource0"),
                &MapConfig::default(),
            )
            .unwrap_err();
        assert_eq!(err.code(), -libc::ENOENT);
    }

    #[test]
    fn maps_a_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 16).unwrap();

        let mut backend = SysBackend::new();
        let config = MapConfig::default().with_locked(false);
        let fd = backend.open(file.path(), &config).unwrap();
        let len = usize::try_from(backend.page_size()).unwrap();
        let addr = backend.map(fd, len, 0, &config).unwrap();

        // SAFETY: addr is a fresh read-write mapping of at least 4 bytes.
        unsafe {
            addr.as_ptr().cast::<u32>().write_volatile(0xA5A5_5A5A);
            assert_eq!(addr.as_ptr().cast::<u32>().read_volatile(), 0xA5A5_5A5A);
            backend.unmap(addr, len).unwrap();
        }
        backend.close(fd).unwrap();
    }
}
