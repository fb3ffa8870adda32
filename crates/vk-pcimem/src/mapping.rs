//! Map/unmap lifecycle
//!
//! A [`MappingInfo`] moves through three states:
//!
//! ```text
//! init()            map_base()          deinit()
//! ───────▶ Opened ─────────────▶ Mapped ─────────▶ Unmapped
//!            │                                        ▲
//!            └──────────────── close() ───────────────┘
//! ```
//!
//! `PciMem` owns the backend and the registry of active mappings; callers own
//! their `MappingInfo`s. Descriptors are shared by device/BAR: a second
//! `init` on a BAR that is already mapped reuses the mapping's descriptor
//! instead of opening the file again, and the descriptor is closed when its
//! last user is released.

use crate::backend::{MapBackend, SysBackend};
use crate::config::MapConfig;
use crate::error::{PciMemError, RangeError, Result};
use crate::id::DeviceBarId;
use crate::registry::{MappingRegistry, RegistryEntry};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`MappingInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Device open, nothing mapped
    Opened,
    /// Window mapped and accessible
    Mapped,
    /// Released; terminal
    Unmapped,
}

impl std::fmt::Display for MappingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Mapped => write!(f, "mapped"),
            Self::Unmapped => write!(f, "unmapped"),
        }
    }
}

/// Per-caller view of one device/BAR window
///
/// Offsets handed to the accessors are absolute BAR offsets. The accessible
/// window is `[requested_offset, requested_offset + requested_size)`; the OS
/// mapping behind it starts at the page boundary below `requested_offset`
/// and spans `mapped_size` bytes.
#[derive(Debug)]
pub struct MappingInfo {
    pub(crate) device_id: DeviceBarId,
    pub(crate) path: PathBuf,
    pub(crate) fd: Option<RawFd>,
    pub(crate) map_base: Option<NonNull<u8>>,
    pub(crate) map_offset_base: u64,
    pub(crate) requested_offset: u64,
    pub(crate) requested_size: u64,
    pub(crate) mapped_size: u64,
    pub(crate) state: MappingState,
    pub(crate) owner: u64,
}

impl MappingInfo {
    /// Device/BAR this info refers to
    #[must_use]
    pub const fn device_id(&self) -> DeviceBarId {
        self.device_id
    }

    /// Device path passed to `init`
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor in use, if any
    #[must_use]
    pub const fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    /// Base address of the OS mapping; `Some` only while mapped
    #[must_use]
    pub const fn map_base(&self) -> Option<NonNull<u8>> {
        self.map_base
    }

    /// Sub-page offset of `requested_offset` inside the mapping
    #[must_use]
    pub const fn map_offset_base(&self) -> u64 {
        self.map_offset_base
    }

    /// First accessible BAR offset
    #[must_use]
    pub const fn requested_offset(&self) -> u64 {
        self.requested_offset
    }

    /// Logical window size accesses are checked against
    #[must_use]
    pub const fn requested_size(&self) -> u64 {
        self.requested_size
    }

    /// Page-rounded size of the OS mapping
    #[must_use]
    pub const fn mapped_size(&self) -> u64 {
        self.mapped_size
    }

    /// Page-aligned BAR offset the OS mapping starts at
    #[must_use]
    pub const fn aligned_offset(&self) -> u64 {
        self.requested_offset - self.map_offset_base
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> MappingState {
        self.state
    }

    /// Whether a window is mapped
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        matches!(self.state, MappingState::Mapped)
    }

    fn clear_mapping(&mut self) {
        self.map_base = None;
        self.map_offset_base = 0;
        self.requested_size = 0;
        self.mapped_size = 0;
    }
}

/// BAR mapping manager: backend, registry and configuration
///
/// Single-threaded: every operation that changes mappings takes `&mut self`.
/// Dropping a `PciMem` unmaps and closes whatever is still registered.
#[derive(Debug)]
pub struct PciMem<B: MapBackend = SysBackend> {
    pub(crate) backend: B,
    pub(crate) registry: MappingRegistry,
    pub(crate) config: MapConfig,
    owner: u64,
}

impl PciMem<SysBackend> {
    /// Manager over the real device files with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(SysBackend::new())
    }

    /// Manager over the real device files
    #[must_use]
    pub fn with_config(config: MapConfig) -> Self {
        Self::with_backend_and_config(SysBackend::new(), config)
    }
}

impl Default for PciMem<SysBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: MapBackend> PciMem<B> {
    /// Manager over `backend` with the default configuration
    pub fn with_backend(backend: B) -> Self {
        Self::with_backend_and_config(backend, MapConfig::default())
    }

    /// Manager over `backend`
    pub fn with_backend_and_config(backend: B, config: MapConfig) -> Self {
        Self {
            backend,
            registry: MappingRegistry::new(),
            config,
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Backend in use
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Backend in use, mutably (fake devices are poked through this)
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Active mappings
    pub const fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    /// Configuration in use
    pub const fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Replace the configuration for subsequent operations
    pub fn set_config(&mut self, config: MapConfig) {
        self.config = config;
    }

    /// Page size of the backend
    pub fn page_size(&self) -> u64 {
        self.backend.page_size()
    }

    /// Open a device file, reusing the descriptor of an active mapping of the
    /// same device/BAR.
    ///
    /// The returned info is `Opened` with a logical size of one page.
    ///
    /// # Errors
    ///
    /// Returns a parse error for a malformed path, or the OS error of `open`.
    pub fn init(&mut self, device_path: &str) -> Result<MappingInfo> {
        let device_id = DeviceBarId::resolve(device_path)?;

        let fd = if let Some(entry) = self.registry.find_by_id(device_id) {
            tracing::debug!("{device_id}: reusing fd {} of active mapping", entry.fd);
            entry.fd
        } else {
            self.backend.open(Path::new(device_path), &self.config)?
        };
        let users = self.registry.retain_fd(fd);
        tracing::debug!("{device_id}: {device_path} opened (fd {fd}, {users} user(s))");

        Ok(MappingInfo {
            device_id,
            path: PathBuf::from(device_path),
            fd: Some(fd),
            map_base: None,
            map_offset_base: 0,
            requested_offset: 0,
            requested_size: self.backend.page_size(),
            mapped_size: 0,
            state: MappingState::Opened,
            owner: self.owner,
        })
    }

    /// Map the window `[offset, offset + length)` of an opened device.
    ///
    /// The OS mapping starts at the page boundary at or below `offset` and is
    /// rounded up to whole pages; accesses are still checked against the
    /// requested window.
    ///
    /// # Errors
    ///
    /// - [`PciMemError::AlreadyMapped`] if `info` is mapped, or another info
    ///   holds the mapping of this device/BAR
    /// - [`PciMemError::InvalidState`] if `info` was released
    /// - [`RangeError::ZeroLength`] / [`RangeError::OutOfBounds`] for an empty
    ///   or overflowing window
    /// - the OS error of `mmap`
    pub fn map_base(&mut self, info: &mut MappingInfo, offset: u64, length: u64) -> Result<()> {
        self.check_owner(info)?;
        match info.state {
            MappingState::Opened => {}
            MappingState::Mapped => {
                return Err(PciMemError::AlreadyMapped {
                    id: info.device_id,
                })
            }
            MappingState::Unmapped => {
                return Err(PciMemError::invalid_state(format!(
                    "{} was released",
                    info.device_id
                )))
            }
        }
        if length == 0 {
            return Err(RangeError::ZeroLength.into());
        }
        if self.registry.find_by_id(info.device_id).is_some() {
            return Err(PciMemError::AlreadyMapped {
                id: info.device_id,
            });
        }
        let fd = info
            .fd
            .ok_or_else(|| {
                PciMemError::invalid_state(format!("{} has no descriptor", info.device_id))
            })?;

        let page = self.backend.page_size();
        let aligned = offset & !(page - 1);
        let residual = offset - aligned;
        let overflow = || RangeError::OutOfBounds {
            offset,
            len: length,
            start: 0,
            end: u64::MAX,
        };
        offset.checked_add(length).ok_or_else(overflow)?;
        let mapped_size = residual
            .checked_add(length)
            .and_then(|n| n.checked_next_multiple_of(page))
            .ok_or_else(overflow)?;
        let map_len = usize::try_from(mapped_size).map_err(|_| overflow())?;

        let base = self.backend.map(fd, map_len, aligned, &self.config)?;
        tracing::debug!(
            "{}: mapped {mapped_size:#x} bytes at BAR offset {aligned:#x} -> {base:p} \
             (window {offset:#x}+{length:#x})",
            info.device_id
        );

        self.registry.insert(RegistryEntry {
            device_id: info.device_id,
            fd,
            mapped_base_offset: aligned,
            mapped_size,
            virtual_address: base,
        })?;

        info.map_base = Some(base);
        info.map_offset_base = residual;
        info.requested_offset = offset;
        info.requested_size = length;
        info.mapped_size = mapped_size;
        info.state = MappingState::Mapped;
        Ok(())
    }

    /// Unmap the window, drop the registry entry and release the descriptor.
    ///
    /// The info ends up `Unmapped` with no base address even when `munmap` or
    /// `close` fails; the first failure is returned.
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidState`] if `info` is not mapped, otherwise the OS
    /// error of `munmap` or `close`.
    pub fn deinit(&mut self, info: &mut MappingInfo) -> Result<()> {
        self.check_owner(info)?;
        let (MappingState::Mapped, Some(base)) = (info.state, info.map_base) else {
            return Err(PciMemError::invalid_state(format!(
                "{} is {}, not mapped",
                info.device_id, info.state
            )));
        };

        let len = usize::try_from(info.mapped_size)
            .map_err(|_| PciMemError::invalid_state("mapped size exceeds address space"))?;
        // SAFETY: base/mapped_size were returned by `map` in map_base and the
        // mapping has not been released (state is Mapped). Accessors never
        // hand out references into the window.
        let unmapped = unsafe { self.backend.unmap(base, len) };

        let registered = self
            .registry
            .find_by_id(info.device_id)
            .is_some_and(|entry| entry.virtual_address == base);
        if registered {
            self.registry.remove(info.device_id)?;
        } else {
            tracing::warn!("{}: registry entry does not match mapping", info.device_id);
        }

        tracing::debug!("{}: unmapped {base:p} ({len:#x} bytes)", info.device_id);
        info.clear_mapping();
        info.state = MappingState::Unmapped;
        let released = self.release_fd(info);
        unmapped.and(released)
    }

    /// Release an opened info that was never mapped.
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidState`] if `info` is mapped (use
    /// [`Self::deinit`]) or already released, otherwise the OS error of
    /// `close`.
    pub fn close(&mut self, info: &mut MappingInfo) -> Result<()> {
        self.check_owner(info)?;
        match info.state {
            MappingState::Opened => {
                info.clear_mapping();
                info.state = MappingState::Unmapped;
                self.release_fd(info)
            }
            state => Err(PciMemError::invalid_state(format!(
                "{} is {state}, expected opened",
                info.device_id
            ))),
        }
    }

    pub(crate) fn check_owner(&self, info: &MappingInfo) -> Result<()> {
        if info.owner == self.owner {
            Ok(())
        } else {
            Err(PciMemError::invalid_state(format!(
                "{} belongs to another PciMem",
                info.device_id
            )))
        }
    }

    fn release_fd(&mut self, info: &mut MappingInfo) -> Result<()> {
        let Some(fd) = info.fd.take() else {
            return Ok(());
        };
        let remaining = self.registry.release_fd(fd);
        if remaining > 0 {
            tracing::debug!("{}: fd {fd} still has {remaining} user(s)", info.device_id);
            return Ok(());
        }
        self.backend.close(fd)
    }
}

impl<B: MapBackend> Drop for PciMem<B> {
    fn drop(&mut self) {
        let (entries, fds) = self.registry.drain();
        for entry in entries {
            tracing::warn!("{}: still mapped at teardown, unmapping", entry.device_id);
            let Ok(len) = usize::try_from(entry.mapped_size) else {
                continue;
            };
            // SAFETY: the entry was recorded by map_base and never unmapped;
            // infos referring to it can no longer reach it (owner check).
            if let Err(e) = unsafe { self.backend.unmap(entry.virtual_address, len) } {
                tracing::error!("{}: unmap failed during drop: {e}", entry.device_id);
            }
        }
        for fd in fds {
            if let Err(e) = self.backend.close(fd) {
                tracing::error!("close of fd {fd} failed during drop: {e}");
            }
        }
    }
}
