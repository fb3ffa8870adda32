//! Operating system boundary
//!
//! Everything the mapping layer needs from the OS goes through
//! [`MapBackend`]:
//! - **Sys**: real `open`/`mmap`/`munmap`/`close` on sysfs resource files
//! - **Memory**: heap-backed fake devices for tests and development without a
//!   card

pub mod memory;
pub mod sys;

pub use memory::{BackendStats, MemoryBackend};
pub use sys::SysBackend;

use crate::config::MapConfig;
use crate::error::Result;
use std::fmt::Debug;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

/// OS primitives consumed by [`crate::PciMem`]
pub trait MapBackend: Debug {
    /// Page size mappings are aligned to (a power of two)
    fn page_size(&self) -> u64;

    /// Open a device file read-write
    ///
    /// # Errors
    ///
    /// Returns an OS error if the file cannot be opened.
    fn open(&mut self, path: &Path, config: &MapConfig) -> Result<RawFd>;

    /// Map `len` bytes of `fd` starting at page-aligned `offset`, shared and
    /// read-write
    ///
    /// # Errors
    ///
    /// Returns an OS error if the mapping cannot be established.
    fn map(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: u64,
        config: &MapConfig,
    ) -> Result<NonNull<u8>>;

    /// Remove a mapping
    ///
    /// # Errors
    ///
    /// Returns an OS error if the kernel rejects the unmap.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe a mapping returned by [`Self::map`] on
    /// this backend that has not been unmapped yet, and no reference into it
    /// may outlive this call.
    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<()>;

    /// Close a descriptor returned by [`Self::open`]
    ///
    /// # Errors
    ///
    /// Returns an OS error if `close` fails.
    fn close(&mut self, fd: RawFd) -> Result<()>;

    /// Backend type for debugging
    fn kind(&self) -> BackendKind;
}

/// Borrowed backends, so a caller can inspect one after the `PciMem` using it
/// is gone
impl<B: MapBackend + ?Sized> MapBackend for &mut B {
    fn page_size(&self) -> u64 {
        (**self).page_size()
    }

    fn open(&mut self, path: &Path, config: &MapConfig) -> Result<RawFd> {
        (**self).open(path, config)
    }

    fn map(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: u64,
        config: &MapConfig,
    ) -> Result<NonNull<u8>> {
        (**self).map(fd, len, offset, config)
    }

    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { (**self).unmap(addr, len) }
    }

    fn close(&mut self, fd: RawFd) -> Result<()> {
        (**self).close(fd)
    }

    fn kind(&self) -> BackendKind {
        (**self).kind()
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Real device files
    Sys,

    /// In-memory fake devices
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sys => write!(f, "Sys"),
            Self::Memory => write!(f, "Memory (fake device)"),
        }
    }
}
