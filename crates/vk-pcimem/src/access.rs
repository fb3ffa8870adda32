//! Scalar and block access to mapped windows
//!
//! All offsets are absolute BAR offsets. Every access is volatile. A scalar at
//! an address aligned to its width is a single access of that width; an
//! unaligned scalar is split into byte accesses in native byte order. A block
//! access is checked as a whole before any byte moves, so a rejected request
//! never copies partially.

use crate::backend::MapBackend;
use crate::error::{PciMemError, RangeError, Result};
use crate::mapping::{MappingInfo, MappingState, PciMem};
use std::ptr::NonNull;

/// Scalar access width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessWidth {
    /// 1 byte
    Bits8 = 1,
    /// 2 bytes
    Bits16 = 2,
    /// 4 bytes
    Bits32 = 4,
    /// 8 bytes
    Bits64 = 8,
}

impl AccessWidth {
    /// Width in bytes
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self as u64
    }

    /// Mask selecting the low `bytes()` bytes of a value
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::Bits8 => 0xFF,
            Self::Bits16 => 0xFFFF,
            Self::Bits32 => 0xFFFF_FFFF,
            Self::Bits64 => u64::MAX,
        }
    }

    /// Hex digits needed to print a full-width value
    #[must_use]
    pub const fn hex_digits(self) -> usize {
        self as usize * 2
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = RangeError;

    fn try_from(width: usize) -> std::result::Result<Self, RangeError> {
        match width {
            1 => Ok(Self::Bits8),
            2 => Ok(Self::Bits16),
            4 => Ok(Self::Bits32),
            8 => Ok(Self::Bits64),
            _ => Err(RangeError::UnsupportedWidth { width }),
        }
    }
}

impl std::fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

impl<B: MapBackend> PciMem<B> {
    /// Read a `width`-sized value at `offset`, zero-extended.
    ///
    /// # Errors
    ///
    /// Bounds and state errors; see [`Self::write`].
    pub fn read(&self, info: &MappingInfo, offset: u64, width: AccessWidth) -> Result<u64> {
        let ptr = self.target(info, offset, width.bytes())?;
        // SAFETY: target checked the range against a live mapping.
        let value = unsafe { load(ptr, width) };
        tracing::trace!("{} read {offset:#x} = {value:#x} ({width})", info.device_id);
        Ok(value)
    }

    /// Write the low `width` bytes of `value` at `offset`.
    ///
    /// With [`crate::MapConfig::verify_writes`] set, the location is read back
    /// and compared against the truncated value.
    ///
    /// # Errors
    ///
    /// - [`RangeError::OutOfBounds`] if `offset..offset + width` leaves the window
    /// - [`RangeError::VerifyMismatch`] if the read-back differs
    /// - [`PciMemError::InvalidState`] for a released or foreign info
    pub fn write(
        &mut self,
        info: &MappingInfo,
        offset: u64,
        value: u64,
        width: AccessWidth,
    ) -> Result<()> {
        let ptr = self.target(info, offset, width.bytes())?;
        let expected = value & width.mask();
        // SAFETY: as in `read`.
        unsafe { store(ptr, width, expected) };
        tracing::trace!("{} write {offset:#x} <- {expected:#x} ({width})", info.device_id);

        if self.config.verify_writes {
            // SAFETY: same location as the store above.
            let actual = unsafe { load(ptr, width) };
            if actual != expected {
                return Err(RangeError::VerifyMismatch {
                    offset,
                    expected,
                    actual,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Write without read-back, for doorbells and handshake flags whose value
    /// changes under the writer.
    ///
    /// # Errors
    ///
    /// Bounds and state errors as for [`Self::write`].
    pub fn write_raw(
        &mut self,
        info: &MappingInfo,
        offset: u64,
        value: u64,
        width: AccessWidth,
    ) -> Result<()> {
        let ptr = self.target(info, offset, width.bytes())?;
        // SAFETY: as in `read`.
        unsafe { store(ptr, width, value & width.mask()) };
        tracing::trace!("{} raw write {offset:#x} <- {value:#x} ({width})", info.device_id);
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the window.
    ///
    /// # Errors
    ///
    /// [`RangeError::OutOfBounds`] if the span leaves the window (nothing is
    /// copied), or a state error.
    pub fn block_read(&self, info: &MappingInfo, offset: u64, buf: &mut [u8]) -> Result<()> {
        let ptr = self.target(info, offset, buf.len() as u64)?;
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: the span was checked against a live mapping.
            *byte = unsafe { ptr.as_ptr().add(i).read_volatile() };
        }
        tracing::trace!("{} block read {offset:#x}+{:#x}", info.device_id, buf.len());
        Ok(())
    }

    /// Copy `data` into the window at `offset`.
    ///
    /// With [`crate::MapConfig::verify_writes`] set, the span is read back and
    /// the first differing byte is reported.
    ///
    /// # Errors
    ///
    /// [`RangeError::OutOfBounds`] if the span leaves the window (nothing is
    /// copied), [`RangeError::BlockVerifyMismatch`] on read-back mismatch, or a
    /// state error.
    pub fn block_write(&mut self, info: &MappingInfo, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.target(info, offset, data.len() as u64)?;
        for (i, &byte) in data.iter().enumerate() {
            // SAFETY: as in `block_read`.
            unsafe { ptr.as_ptr().add(i).write_volatile(byte) };
        }
        tracing::trace!("{} block write {offset:#x}+{:#x}", info.device_id, data.len());

        if self.config.verify_writes {
            for (i, &expected) in data.iter().enumerate() {
                // SAFETY: same span as the copy above.
                let actual = unsafe { ptr.as_ptr().add(i).read_volatile() };
                if actual != expected {
                    return Err(RangeError::BlockVerifyMismatch {
                        offset: offset + i as u64,
                        expected,
                        actual,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Resolve `offset..offset + len` to an address inside a live mapping.
    ///
    /// Mapped infos are checked against their own window. Opened infos fall
    /// back to whatever mapping the registry holds for their device/BAR.
    fn target(&self, info: &MappingInfo, offset: u64, len: u64) -> Result<NonNull<u8>> {
        self.check_owner(info)?;
        let id = info.device_id;
        match info.state {
            MappingState::Mapped => {
                let base = info.map_base.ok_or_else(|| {
                    PciMemError::invalid_state(format!("{id} is mapped without a base"))
                })?;
                let start = info.requested_offset;
                let end = start + info.requested_size;
                if offset < start || offset.checked_add(len).map_or(true, |e| e > end) {
                    return Err(RangeError::OutOfBounds {
                        offset,
                        len,
                        start,
                        end,
                    }
                    .into());
                }
                Ok(offset_ptr(base, info.map_offset_base + (offset - start)))
            }
            MappingState::Opened => {
                let Some(entry) = self.registry.find_by_range(id, offset, len) else {
                    return Err(match self.registry.find_by_id(id) {
                        Some(entry) => RangeError::OutOfBounds {
                            offset,
                            len,
                            start: entry.mapped_base_offset,
                            end: entry.mapped_base_offset + entry.mapped_size,
                        }
                        .into(),
                        None => {
                            PciMemError::invalid_state(format!("{id} is opened but not mapped"))
                        }
                    });
                };
                Ok(offset_ptr(entry.virtual_address, offset - entry.mapped_base_offset))
            }
            MappingState::Unmapped => {
                Err(PciMemError::invalid_state(format!("{id} was released")))
            }
        }
    }
}

/// `base + rel` for a `rel` already checked to lie inside the mapping
#[allow(clippy::cast_possible_truncation)]
fn offset_ptr(base: NonNull<u8>, rel: u64) -> NonNull<u8> {
    // SAFETY: callers bound `rel` by the mapping size, which fit in usize
    // when the mapping was created.
    unsafe { NonNull::new_unchecked(base.as_ptr().add(rel as usize)) }
}

#[allow(clippy::cast_possible_truncation)]
fn is_aligned(ptr: NonNull<u8>, width: AccessWidth) -> bool {
    ptr.as_ptr() as usize % width.bytes() as usize == 0
}

/// # Safety
///
/// `ptr` must be valid for a `width`-byte read.
unsafe fn load(ptr: NonNull<u8>, width: AccessWidth) -> u64 {
    let p = ptr.as_ptr();
    if !is_aligned(ptr, width) {
        let mut b = [0u8; 8];
        for (i, byte) in b.iter_mut().take(width as usize).enumerate() {
            *byte = unsafe { p.add(i).read_volatile() };
        }
        return match width {
            AccessWidth::Bits8 => u64::from(b[0]),
            AccessWidth::Bits16 => u64::from(u16::from_ne_bytes([b[0], b[1]])),
            AccessWidth::Bits32 => u64::from(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            AccessWidth::Bits64 => u64::from_ne_bytes(b),
        };
    }
    unsafe {
        match width {
            AccessWidth::Bits8 => u64::from(p.read_volatile()),
            AccessWidth::Bits16 => u64::from(p.cast::<u16>().read_volatile()),
            AccessWidth::Bits32 => u64::from(p.cast::<u32>().read_volatile()),
            AccessWidth::Bits64 => p.cast::<u64>().read_volatile(),
        }
    }
}

/// # Safety
///
/// `ptr` must be valid for a `width`-byte write.
#[allow(clippy::cast_possible_truncation)]
unsafe fn store(ptr: NonNull<u8>, width: AccessWidth, value: u64) {
    let p = ptr.as_ptr();
    if !is_aligned(ptr, width) {
        let mut b = [0u8; 8];
        match width {
            AccessWidth::Bits8 => b[0] = value as u8,
            AccessWidth::Bits16 => b[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
            AccessWidth::Bits32 => b[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
            AccessWidth::Bits64 => b = value.to_ne_bytes(),
        }
        for (i, &byte) in b.iter().take(width as usize).enumerate() {
            unsafe { p.add(i).write_volatile(byte) };
        }
        return;
    }
    unsafe {
        match width {
            AccessWidth::Bits8 => p.write_volatile(value as u8),
            AccessWidth::Bits16 => p.cast::<u16>().write_volatile(value as u16),
            AccessWidth::Bits32 => p.cast::<u32>().write_volatile(value as u32),
            AccessWidth::Bits64 => p.cast::<u64>().write_volatile(value),
        }
    }
}
