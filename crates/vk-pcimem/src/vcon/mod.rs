//! Virtual console: log spool and command channel in BAR2
//!
//! The card keeps a ring of fixed-length log lines (the spool) behind a
//! small header at [`SPOOL_BAR2_OFFSET`], and a command channel the host
//! writes into. Parsing works on byte images so the same code reads a live
//! window ([`read_spool`], [`VconChannel`]) and an offline dump file
//! ([`parse_spool`], [`parse_console`]).

mod channel;

pub use channel::{CommandPoll, VconChannel};

use crate::backend::MapBackend;
use crate::error::{PciMemError, RangeError, Result};
use crate::mapping::{MappingInfo, PciMem};
use bytemuck::{Pod, Zeroable};
use vk_chip::vcon::{console, HEADER_SIZE, MARKER, MAX_SPOOL_ENTRIES, MAX_SPOOL_ENTRY_LEN};

pub use vk_chip::vcon::SPOOL_BAR2_OFFSET;

/// Logger header as laid out by the firmware (little endian)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SpoolHeader {
    /// [`MARKER`] once the firmware is up
    pub marker: u32,
    /// Command channel offset from the header
    pub cmd_off: u32,
    /// Number of spool lines
    pub spool_nentries: u32,
    /// Bytes per spool line
    pub spool_len: u32,
    /// First spool line offset from the header
    pub spool_off: u32,
    /// Line the firmware writes next
    pub spool_idx: u32,
}

const _: () = assert!(std::mem::size_of::<SpoolHeader>() == HEADER_SIZE);

impl SpoolHeader {
    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// No sanity checks; see [`Self::validate`].
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidHeader`] if `bytes` is too short.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = bytes.get(..HEADER_SIZE).ok_or_else(|| {
            PciMemError::invalid_header(format!(
                "need {HEADER_SIZE} header bytes, got {}",
                bytes.len()
            ))
        })?;
        let header: Self = bytemuck::pod_read_unaligned(raw);
        Ok(Self {
            marker: u32::from_le(header.marker),
            cmd_off: u32::from_le(header.cmd_off),
            spool_nentries: u32::from_le(header.spool_nentries),
            spool_len: u32::from_le(header.spool_len),
            spool_off: u32::from_le(header.spool_off),
            spool_idx: u32::from_le(header.spool_idx),
        })
    }

    /// Check the marker and the spool geometry.
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidHeader`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.marker != MARKER {
            return Err(PciMemError::invalid_header(format!(
                "marker {:#010x}, expected {MARKER:#010x}",
                self.marker
            )));
        }
        if self.spool_len == 0 || self.spool_len > MAX_SPOOL_ENTRY_LEN {
            return Err(PciMemError::invalid_header(format!(
                "spool_len {} not in 1..={MAX_SPOOL_ENTRY_LEN}",
                self.spool_len
            )));
        }
        if !self.spool_nentries.is_power_of_two() || self.spool_nentries > MAX_SPOOL_ENTRIES {
            return Err(PciMemError::invalid_header(format!(
                "spool_nentries {} is not a power of two up to {MAX_SPOOL_ENTRIES}",
                self.spool_nentries
            )));
        }
        Ok(())
    }

    /// Offset of line `index` from the header
    pub const fn entry_offset(&self, index: u32) -> u64 {
        self.spool_off as u64 + index as u64 * self.spool_len as u64
    }

    /// Bytes from the header to the end of the last spool line
    pub const fn spool_extent(&self) -> u64 {
        self.entry_offset(self.spool_nentries)
    }

    /// Oldest line in the ring
    pub const fn oldest_index(&self) -> u32 {
        self.next_index(self.spool_idx)
    }

    /// Line after `index`, wrapping
    pub const fn next_index(&self, index: u32) -> u32 {
        index.wrapping_add(1) & self.spool_nentries.wrapping_sub(1)
    }
}

/// One non-empty spool line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolLine {
    /// Ring index the line was read from
    pub index: u32,
    /// Text up to the first NUL
    pub text: String,
}

impl std::fmt::Display for SpoolLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{:4}> {}", self.index, self.text)
    }
}

/// Text of one spool entry, `None` if it is empty.
///
/// The last byte of an entry is always treated as a terminator.
pub(crate) fn entry_text(entry: &[u8]) -> Option<String> {
    let usable = &entry[..entry.len().saturating_sub(1)];
    let end = usable.iter().position(|&b| b == 0).unwrap_or(usable.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&usable[..end]).into_owned())
}

/// Decode the spool from an image whose first byte is the header.
///
/// Lines are returned oldest first, starting after `spool_idx` and walking
/// the whole ring once. Empty lines are skipped.
///
/// # Errors
///
/// [`PciMemError::InvalidHeader`] for a bad header or an image too short for
/// the spool it describes.
pub fn parse_spool(image: &[u8]) -> Result<Vec<SpoolLine>> {
    let header = SpoolHeader::parse(image)?;
    header.validate()?;
    tracing::debug!(
        "spool: {} entries of {} bytes at {:#x}, idx {}",
        header.spool_nentries,
        header.spool_len,
        header.spool_off,
        header.spool_idx
    );

    let extent = usize::try_from(header.spool_extent()).unwrap_or(usize::MAX);
    if image.len() < extent {
        return Err(PciMemError::invalid_header(format!(
            "spool ends at {extent:#x}, image is {:#x} bytes",
            image.len()
        )));
    }

    let len = header.spool_len as usize;
    let mut lines = Vec::new();
    let mut index = header.oldest_index();
    for _ in 0..header.spool_nentries {
        // entry_offset(index) + len <= extent <= image.len()
        #[allow(clippy::cast_possible_truncation)]
        let start = header.entry_offset(index) as usize;
        if let Some(text) = entry_text(&image[start..start + len]) {
            lines.push(SpoolLine { index, text });
        }
        index = header.next_index(index);
    }
    Ok(lines)
}

/// Read the spool live through a window mapped over the header.
///
/// `info` must start at the header; the window must cover the whole spool.
///
/// # Errors
///
/// Header errors as for [`parse_spool`], [`RangeError::OutOfBounds`] if the
/// header places the spool beyond the window, or an access error.
pub fn read_spool<B: MapBackend>(mem: &PciMem<B>, info: &MappingInfo) -> Result<Vec<SpoolLine>> {
    let base = info.requested_offset();
    let mut raw = [0u8; HEADER_SIZE];
    mem.block_read(info, base, &mut raw)?;
    let header = SpoolHeader::parse(&raw)?;
    header.validate()?;

    let extent = header.spool_extent();
    if extent > info.requested_size() {
        return Err(RangeError::OutOfBounds {
            offset: base,
            len: extent,
            start: base,
            end: base + info.requested_size(),
        }
        .into());
    }
    let extent = usize::try_from(extent)
        .map_err(|_| PciMemError::invalid_header("spool extent overflows"))?;
    let mut image = vec![0u8; extent.max(HEADER_SIZE)];
    mem.block_read(info, base, &mut image)?;
    parse_spool(&image)
}

/// Console ring header (`reserved, size, wr, rd`, little endian)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ConsoleHeader {
    /// Unused
    pub reserved: u32,
    /// Ring data size, [`console::DATA_SIZE`] on a sane dump
    pub size: u32,
    /// Write index relative to the data
    pub wr: u32,
    /// Read index relative to the data
    pub rd: u32,
}

impl ConsoleHeader {
    /// Decode and sanity check the header at the start of `image`.
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidHeader`] if the image is short, the size is not
    /// [`console::DATA_SIZE`], or an index is past the size.
    pub fn parse(image: &[u8]) -> Result<Self> {
        let raw = image.get(..console::DATA_OFFSET).ok_or_else(|| {
            let len = image.len();
            PciMemError::invalid_header(format!("console dump of {len} bytes has no header"))
        })?;
        let header: Self = bytemuck::pod_read_unaligned(raw);
        let header = Self {
            reserved: u32::from_le(header.reserved),
            size: u32::from_le(header.size),
            wr: u32::from_le(header.wr),
            rd: u32::from_le(header.rd),
        };
        if header.size != console::DATA_SIZE {
            return Err(PciMemError::invalid_header(format!(
                "console size {:#x}, expected {:#x}",
                header.size,
                console::DATA_SIZE
            )));
        }
        if header.rd > header.size || header.wr > header.size {
            return Err(PciMemError::invalid_header(format!(
                "console indices wr {} rd {} exceed size {}",
                header.wr, header.rd, header.size
            )));
        }
        Ok(header)
    }
}

/// Decode a console ring dump into text.
///
/// Output starts just after the write index and wraps around to it, so the
/// oldest byte comes first. NUL bytes (unwritten ring space) are dropped.
///
/// # Errors
///
/// Header errors as for [`ConsoleHeader::parse`].
pub fn parse_console(image: &[u8]) -> Result<String> {
    let header = ConsoleHeader::parse(image)?;
    tracing::debug!(
        "console: size {} wr {} rd {}",
        header.size,
        header.wr,
        header.rd
    );

    let data_start = console::DATA_OFFSET;
    let data_end = image.len().min(console::MAX_LEN);
    let wr = data_start + header.wr as usize;

    let mut out = Vec::new();
    let mut pos = wr + 1;
    // a truncated dump may not contain `wr`; visit each ring byte at most once
    for _ in data_start..data_end {
        if pos >= data_end {
            pos = data_start;
        }
        if pos == wr {
            break;
        }
        match image.get(pos) {
            Some(&b) if b != 0 => out.push(b),
            _ => {}
        }
        pos += 1;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(h: &SpoolHeader) -> Vec<u8> {
        [
            h.marker,
            h.cmd_off,
            h.spool_nentries,
            h.spool_len,
            h.spool_off,
            h.spool_idx,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }

    fn header(nentries: u32, len: u32, idx: u32) -> SpoolHeader {
        SpoolHeader {
            marker: MARKER,
            cmd_off: 0x20,
            spool_nentries: nentries,
            spool_len: len,
            spool_off: 0x100,
            spool_idx: idx,
        }
    }

    #[test]
    fn header_decodes_little_endian() {
        let h = header(8, 64, 3);
        assert_eq!(SpoolHeader::parse(&header_bytes(&h)).unwrap(), h);
        assert!(SpoolHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn header_geometry() {
        let h = header(8, 64, 7);
        assert_eq!(h.entry_offset(2), 0x100 + 128);
        assert_eq!(h.spool_extent(), 0x100 + 8 * 64);
        assert_eq!(h.oldest_index(), 0);
        assert_eq!(h.next_index(3), 4);
    }

    #[test]
    fn header_validation() {
        assert!(header(8, 64, 0).validate().is_ok());
        assert!(header(MAX_SPOOL_ENTRIES, MAX_SPOOL_ENTRY_LEN, 0).validate().is_err());
        assert!(header(8192, MAX_SPOOL_ENTRY_LEN, 0).validate().is_ok());

        let mut bad_marker = header(8, 64, 0);
        bad_marker.marker = 0xDEAD_BEEF;
        for bad in [
            bad_marker,
            header(8, 0, 0),
            header(8, MAX_SPOOL_ENTRY_LEN + 1, 0),
            header(0, 64, 0),
            header(6, 64, 0),
            header(16384, 64, 0),
        ] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, PciMemError::InvalidHeader { .. }), "{bad:?}");
            assert_eq!(err.code(), -libc::EINVAL);
        }
    }

    #[test]
    fn entry_text_stops_at_nul_and_reserves_last_byte() {
        assert_eq!(entry_text(b"hello\0junk"), Some("hello".to_string()));
        assert_eq!(entry_text(b"abcd"), Some("abc".to_string()));
        assert_eq!(entry_text(b"\0abc"), None);
        assert_eq!(entry_text(b""), None);
    }

    #[test]
    fn console_header_checks() {
        let mut image = vec![0u8; console::MAX_LEN];
        image[4..8].copy_from_slice(&console::DATA_SIZE.to_le_bytes());
        assert!(ConsoleHeader::parse(&image).is_ok());

        image[8..12].copy_from_slice(&(console::DATA_SIZE + 1).to_le_bytes());
        assert!(ConsoleHeader::parse(&image).is_err());

        image[8..12].copy_from_slice(&0u32.to_le_bytes());
        image[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(ConsoleHeader::parse(&image).is_err());
        assert!(ConsoleHeader::parse(&image[..8]).is_err());
    }
}
