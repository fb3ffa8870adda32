//! Scoped mappings

use crate::access::AccessWidth;
use crate::backend::MapBackend;
use crate::error::Result;
use crate::mapping::{MappingInfo, PciMem};

/// A mapped window that unmaps itself when dropped.
///
/// Created by [`PciMem::window`]. Errors from the implicit unmap are logged;
/// call [`BarWindow::release`] to observe them.
#[derive(Debug)]
pub struct BarWindow<'a, B: MapBackend> {
    mem: &'a mut PciMem<B>,
    info: MappingInfo,
}

impl<B: MapBackend> PciMem<B> {
    /// Open `path` and map `[offset, offset + length)` as a scoped window.
    ///
    /// # Errors
    ///
    /// As for [`PciMem::init`] and [`PciMem::map_base`]. The descriptor is
    /// released again if mapping fails.
    pub fn window(&mut self, path: &str, offset: u64, length: u64) -> Result<BarWindow<'_, B>> {
        let mut info = self.init(path)?;
        if let Err(e) = self.map_base(&mut info, offset, length) {
            if let Err(close_err) = self.close(&mut info) {
                tracing::warn!("{path}: close after failed map: {close_err}");
            }
            return Err(e);
        }
        Ok(BarWindow { mem: self, info })
    }
}

impl<B: MapBackend> BarWindow<'_, B> {
    /// Mapping state behind the window
    pub const fn info(&self) -> &MappingInfo {
        &self.info
    }

    /// First accessible BAR offset
    pub const fn offset(&self) -> u64 {
        self.info.requested_offset()
    }

    /// Accessible bytes
    pub const fn len(&self) -> u64 {
        self.info.requested_size()
    }

    /// Always false; empty windows cannot be mapped
    pub const fn is_empty(&self) -> bool {
        self.info.requested_size() == 0
    }

    /// See [`PciMem::read`]
    ///
    /// # Errors
    ///
    /// As for [`PciMem::read`].
    pub fn read(&self, offset: u64, width: AccessWidth) -> Result<u64> {
        self.mem.read(&self.info, offset, width)
    }

    /// See [`PciMem::write`]
    ///
    /// # Errors
    ///
    /// As for [`PciMem::write`].
    pub fn write(&mut self, offset: u64, value: u64, width: AccessWidth) -> Result<()> {
        self.mem.write(&self.info, offset, value, width)
    }

    /// See [`PciMem::write_raw`]
    ///
    /// # Errors
    ///
    /// As for [`PciMem::write_raw`].
    pub fn write_raw(&mut self, offset: u64, value: u64, width: AccessWidth) -> Result<()> {
        self.mem.write_raw(&self.info, offset, value, width)
    }

    /// See [`PciMem::block_read`]
    ///
    /// # Errors
    ///
    /// As for [`PciMem::block_read`].
    pub fn block_read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mem.block_read(&self.info, offset, buf)
    }

    /// See [`PciMem::block_write`]
    ///
    /// # Errors
    ///
    /// As for [`PciMem::block_write`].
    pub fn block_write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.mem.block_write(&self.info, offset, data)
    }

    /// Unmap now and report the result.
    ///
    /// # Errors
    ///
    /// As for [`PciMem::deinit`].
    pub fn release(mut self) -> Result<()> {
        self.mem.deinit(&mut self.info)
    }
}

impl<B: MapBackend> Drop for BarWindow<'_, B> {
    fn drop(&mut self) {
        if !self.info.is_mapped() {
            return;
        }
        if let Err(e) = self.mem.deinit(&mut self.info) {
            tracing::warn!("{}: unmap on drop failed: {e}", self.info.device_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::{PciMemError, RangeError};

    const BAR2: &str = "/sys/class/misc/bcm-vk.0/pci/resource4";

    fn pcimem() -> PciMem<MemoryBackend> {
        PciMem::with_backend(MemoryBackend::new().device(BAR2, 0x8000).unwrap())
    }

    #[test]
    fn window_unmaps_on_drop() {
        let mut mem = pcimem();
        {
            let mut win = mem.window(BAR2, 0x100, 0x40).unwrap();
            assert_eq!(win.offset(), 0x100);
            assert_eq!(win.len(), 0x40);
            win.write(0x13C, 7, AccessWidth::Bits32).unwrap();
            assert_eq!(win.read(0x13C, AccessWidth::Bits32).unwrap(), 7);
            let err = win.read(0x140, AccessWidth::Bits32).unwrap_err();
            assert!(matches!(err, PciMemError::Range(RangeError::OutOfBounds { .. })));
        }
        assert!(mem.registry().is_empty());
        assert_eq!(mem.backend().live_maps(), 0);
        assert_eq!(mem.backend().open_fds(), 0);
        assert_eq!(mem.backend().peek(BAR2, 0x13C, 1).unwrap(), vec![7]);
    }

    #[test]
    fn release_reports_result() {
        let mut mem = pcimem();
        let win = mem.window(BAR2, 0, 8).unwrap();
        win.release().unwrap();
        assert_eq!(mem.backend().stats().unmaps, 1);
        assert_eq!(mem.backend().stats().closes, 1);
    }

    #[test]
    fn failed_map_closes_descriptor() {
        let mut mem = pcimem();
        let err = mem.window(BAR2, 0, 0).unwrap_err();
        assert!(matches!(err, PciMemError::Range(RangeError::ZeroLength)));
        assert_eq!(mem.backend().stats().opens, 1);
        assert_eq!(mem.backend().open_fds(), 0);
    }
}
