//! Registry of active BAR mappings
//!
//! One entry per mapped device/BAR. The registry is what lets a second
//! [`crate::PciMem::init`] on an already mapped BAR reuse the open
//! descriptor, and what resolves an access from a caller that did not map the
//! window itself.
//!
//! Descriptors are shared between every [`crate::MappingInfo`] that opened or
//! reused them; the registry counts those users so a descriptor is closed only
//! when its last user lets go.

use crate::error::{PciMemError, Result};
use crate::id::DeviceBarId;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Bookkeeping for one active mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Device/BAR the mapping belongs to
    pub device_id: DeviceBarId,
    /// Descriptor the mapping was made through
    pub fd: RawFd,
    /// Page-aligned BAR offset the mapping starts at
    pub mapped_base_offset: u64,
    /// Page-rounded size of the mapping
    pub mapped_size: u64,
    /// Address of `mapped_base_offset` in this process
    pub virtual_address: NonNull<u8>,
}

impl RegistryEntry {
    /// Whether `[offset, offset + length)` lies inside this mapping
    #[must_use]
    pub fn contains(&self, offset: u64, length: u64) -> bool {
        let Some(end) = offset.checked_add(length) else {
            return false;
        };
        offset >= self.mapped_base_offset
            && end <= self.mapped_base_offset.saturating_add(self.mapped_size)
    }

    /// Whether the descriptor is still usable
    #[must_use]
    pub const fn has_valid_fd(&self) -> bool {
        self.fd > 0
    }
}

/// Active mappings keyed by device/BAR
#[derive(Debug, Default)]
pub struct MappingRegistry {
    entries: HashMap<DeviceBarId, RegistryEntry>,
    fd_refs: HashMap<RawFd, usize>,
}

impl MappingRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `id`, if it is mapped through a valid descriptor
    #[must_use]
    pub fn find_by_id(&self, id: DeviceBarId) -> Option<&RegistryEntry> {
        self.entries.get(&id).filter(|e| e.has_valid_fd())
    }

    /// Entry for `id` whose mapping fully contains `[offset, offset + length)`
    #[must_use]
    pub fn find_by_range(
        &self,
        id: DeviceBarId,
        offset: u64,
        length: u64,
    ) -> Option<&RegistryEntry> {
        self.find_by_id(id).filter(|e| e.contains(offset, length))
    }

    /// Record a new mapping
    ///
    /// # Errors
    ///
    /// Returns [`PciMemError::AlreadyMapped`] if `entry.device_id` already has
    /// a mapping.
    pub fn insert(&mut self, entry: RegistryEntry) -> Result<()> {
        if self.entries.contains_key(&entry.device_id) {
            return Err(PciMemError::AlreadyMapped {
                id: entry.device_id,
            });
        }
        tracing::trace!(
            "registry: insert {} @ {:#x} size {:#x}",
            entry.device_id,
            entry.mapped_base_offset,
            entry.mapped_size
        );
        self.entries.insert(entry.device_id, entry);
        Ok(())
    }

    /// Remove the mapping of `id`
    ///
    /// # Errors
    ///
    /// Returns [`PciMemError::NotFound`] if `id` has no mapping.
    pub fn remove(&mut self, id: DeviceBarId) -> Result<RegistryEntry> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or(PciMemError::NotFound { id })?;
        tracing::trace!("registry: remove {id}");
        Ok(entry)
    }

    /// Add a user of `fd`
    pub fn retain_fd(&mut self, fd: RawFd) -> usize {
        let refs = self.fd_refs.entry(fd).or_insert(0);
        *refs += 1;
        *refs
    }

    /// Drop a user of `fd`, returning the users left
    pub fn release_fd(&mut self, fd: RawFd) -> usize {
        match self.fd_refs.get_mut(&fd) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                *refs
            }
            Some(_) => {
                self.fd_refs.remove(&fd);
                0
            }
            None => 0,
        }
    }

    /// Users of `fd`
    #[must_use]
    pub fn fd_refs(&self, fd: RawFd) -> usize {
        self.fd_refs.get(&fd).copied().unwrap_or(0)
    }

    /// Descriptors with at least one user
    pub fn open_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fd_refs.keys().copied()
    }

    /// Number of active mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no mapping is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All active mappings
    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Take every entry and descriptor out of the registry
    pub(crate) fn drain(&mut self) -> (Vec<RegistryEntry>, Vec<RawFd>) {
        let entries = self.entries.drain().map(|(_, e)| e).collect();
        let fds = self.fd_refs.drain().map(|(fd, _)| fd).collect();
        (entries, fds)
    }
}
