//! Live console channel over BAR2 (spool + command area) and BAR0 (doorbell)

use super::{read_spool, SpoolHeader, SpoolLine};
use crate::access::AccessWidth;
use crate::backend::MapBackend;
use crate::error::{PciMemError, Result};
use crate::mapping::{MappingInfo, PciMem};
use std::time::{Duration, Instant};
use vk_chip::bar::{regs, Bar};
use vk_chip::node::resource_path;
use vk_chip::vcon::{
    CMD_CHAN_FREE, CMD_CHAN_OCCUPIED, CMD_CHAN_SIZE, CMD_POLL_INTERVAL, CMD_POLL_MAX, COLOR_OFF,
    COLOR_ON, DEFAULT_MAP_SIZE, FOLLOW_POLL_INTERVAL, HEADER_SIZE, MAX_CMD_SIZE, MAX_MAP_SIZE,
    SPOOL_BAR2_OFFSET,
};

/// How long `send_command` waits for the firmware to take a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPoll {
    /// Sleep between flag checks
    pub interval: Duration,
    /// Flag checks before giving up
    pub max_polls: u32,
}

impl Default for CommandPoll {
    fn default() -> Self {
        Self {
            interval: CMD_POLL_INTERVAL,
            max_polls: CMD_POLL_MAX,
        }
    }
}

impl CommandPoll {
    fn total(&self) -> Duration {
        self.interval.saturating_mul(self.max_polls.saturating_add(1))
    }
}

/// Console channel of one card.
///
/// Holds two mappings for its lifetime: the BAR2 window over the logger
/// header, command area and spool, and the 4-byte BAR0 doorbell. Both are
/// released on drop.
#[derive(Debug)]
pub struct VconChannel<'a, B: MapBackend> {
    mem: &'a mut PciMem<B>,
    spool: MappingInfo,
    doorbell: MappingInfo,
    header: SpoolHeader,
    rd_idx: u32,
    poll: CommandPoll,
}

impl<'a, B: MapBackend> VconChannel<'a, B> {
    /// Map the console of card `node`.
    ///
    /// The spool window starts at [`DEFAULT_MAP_SIZE`] and is remapped once if
    /// the header places the command area or spool beyond it.
    ///
    /// # Errors
    ///
    /// Map errors, or [`PciMemError::InvalidHeader`] if the firmware has not
    /// published a sane header or asks for more than [`MAX_MAP_SIZE`].
    pub fn open(mem: &'a mut PciMem<B>, node: u16) -> Result<Self> {
        let spool_path = resource_path(node, Bar::Shared.resource_slot());
        let mut spool = map_window(mem, &spool_path, SPOOL_BAR2_OFFSET, DEFAULT_MAP_SIZE)?;

        let header = match read_header(mem, &spool).and_then(|h| {
            h.validate()?;
            Ok(h)
        }) {
            Ok(h) => h,
            Err(e) => {
                release(mem, &mut spool);
                return Err(e);
            }
        };

        let cmd_end = u64::from(header.cmd_off) + CMD_CHAN_SIZE as u64;
        let required = cmd_end.max(header.spool_extent());
        if required > MAX_MAP_SIZE {
            release(mem, &mut spool);
            return Err(PciMemError::invalid_header(format!(
                "console needs {required:#x} bytes, limit is {MAX_MAP_SIZE:#x}"
            )));
        }
        if required > DEFAULT_MAP_SIZE {
            tracing::debug!("node {node}: remapping console window to {required:#x} bytes");
            mem.deinit(&mut spool)?;
            spool = map_window(mem, &spool_path, SPOOL_BAR2_OFFSET, required)?;
        }

        let doorbell_path = resource_path(node, Bar::Registers.resource_slot());
        let doorbell = match map_window(mem, &doorbell_path, regs::CMD_DOORBELL, 4) {
            Ok(info) => info,
            Err(e) => {
                release(mem, &mut spool);
                return Err(e);
            }
        };

        tracing::info!(
            "node {node}: console open, {} spool lines of {} bytes",
            header.spool_nentries,
            header.spool_len
        );
        Ok(Self {
            mem,
            spool,
            doorbell,
            header,
            rd_idx: header.spool_idx,
            poll: CommandPoll::default(),
        })
    }

    /// Replace the command completion polling
    #[must_use]
    pub fn with_poll(mut self, poll: CommandPoll) -> Self {
        self.poll = poll;
        self
    }

    /// Header read when the channel was opened
    pub const fn header(&self) -> &SpoolHeader {
        &self.header
    }

    /// Lines the firmware wrote since the previous call (or since `open`).
    ///
    /// # Errors
    ///
    /// [`PciMemError::InvalidHeader`] if the marker vanished (card went
    /// down), or an access error.
    pub fn poll_output(&mut self) -> Result<Vec<SpoolLine>> {
        let current = self.live_header()?;
        let len = self.header.spool_len as usize;
        let mut entry = vec![0u8; len];
        let mut lines = Vec::new();

        for _ in 0..self.header.spool_nentries {
            if self.rd_idx == current.spool_idx {
                break;
            }
            let offset = SPOOL_BAR2_OFFSET + self.header.entry_offset(self.rd_idx);
            self.mem.block_read(&self.spool, offset, &mut entry)?;
            if let Some(text) = super::entry_text(&entry) {
                lines.push(SpoolLine {
                    index: self.rd_idx,
                    text,
                });
            }
            self.rd_idx = self.header.next_index(self.rd_idx);
        }
        Ok(lines)
    }

    /// Whole spool, oldest line first
    ///
    /// # Errors
    ///
    /// As for [`super::read_spool`].
    pub fn dump_all(&self) -> Result<Vec<SpoolLine>> {
        read_spool(&*self.mem, &self.spool)
    }

    /// Hand `cmd` to the firmware and wait until it is consumed.
    ///
    /// Text longer than the channel is truncated. An empty command is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - [`PciMemError::Busy`] if a previous command is still pending
    /// - [`PciMemError::Timeout`] if the firmware does not clear the flag
    /// - [`PciMemError::InvalidHeader`] if the card went down
    pub fn send_command(&mut self, cmd: &str) -> Result<()> {
        if cmd.is_empty() {
            return Ok(());
        }
        let current = self.live_header()?;
        let flag_offset = SPOOL_BAR2_OFFSET + u64::from(current.cmd_off);

        if self.read_flag(flag_offset)? != CMD_CHAN_FREE {
            return Err(PciMemError::Busy);
        }

        // last byte of the text area stays NUL
        let mut payload = [0u8; MAX_CMD_SIZE];
        let n = cmd.len().min(MAX_CMD_SIZE - 1);
        payload[..n].copy_from_slice(&cmd.as_bytes()[..n]);
        self.mem.block_write(&self.spool, flag_offset + 1, &payload)?;
        self.mem
            .write_raw(&self.spool, flag_offset, u64::from(CMD_CHAN_OCCUPIED), AccessWidth::Bits8)?;
        self.mem.write_raw(
            &self.doorbell,
            regs::CMD_DOORBELL,
            u64::from(regs::CMD_DOORBELL_VALUE),
            AccessWidth::Bits32,
        )?;
        tracing::debug!(
            "command {:?} posted at {flag_offset:#x}",
            String::from_utf8_lossy(&payload[..n])
        );

        std::thread::sleep(self.poll.interval);
        for _ in 0..self.poll.max_polls {
            if self.read_flag(flag_offset)? == CMD_CHAN_FREE {
                return Ok(());
            }
            std::thread::sleep(self.poll.interval);
        }

        let waited = self.poll.total();
        tracing::warn!("command not consumed after {waited:?}");
        Err(PciMemError::Timeout {
            duration_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Run `cmd` and hand every spool line produced for `duration` to `sink`.
    ///
    /// Colour escapes are switched off around the command so the output is
    /// plain text. The spool is polled every [`FOLLOW_POLL_INTERVAL`].
    ///
    /// # Errors
    ///
    /// As for [`Self::send_command`] and [`Self::poll_output`]. Colour is not
    /// switched back on after a failure.
    pub fn run_command(
        &mut self,
        cmd: &str,
        duration: Duration,
        mut sink: impl FnMut(&SpoolLine),
    ) -> Result<()> {
        self.send_command(COLOR_OFF)?;
        self.send_command(cmd)?;
        tracing::debug!("following output of {cmd:?} for {duration:?}");

        let start = Instant::now();
        while start.elapsed() < duration {
            for line in self.poll_output()? {
                sink(&line);
            }
            std::thread::sleep(FOLLOW_POLL_INTERVAL);
        }
        for line in self.poll_output()? {
            sink(&line);
        }

        self.send_command(COLOR_ON)
    }

    /// Unmap both windows, reporting the first failure
    ///
    /// # Errors
    ///
    /// The first `deinit` error.
    pub fn close(mut self) -> Result<()> {
        self.release_all()
    }

    fn read_flag(&self, offset: u64) -> Result<u8> {
        // Bits8 reads are zero-extended from one byte
        #[allow(clippy::cast_possible_truncation)]
        let flag = self.mem.read(&self.spool, offset, AccessWidth::Bits8)? as u8;
        Ok(flag)
    }

    fn live_header(&self) -> Result<SpoolHeader> {
        let header = read_header(&*self.mem, &self.spool)?;
        if header.marker != self.header.marker {
            return Err(PciMemError::invalid_header(format!(
                "marker lost ({:#010x}), interface going down",
                header.marker
            )));
        }
        Ok(header)
    }

    fn release_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for info in [&mut self.doorbell, &mut self.spool] {
            if info.is_mapped() {
                let r = self.mem.deinit(info);
                if result.is_ok() {
                    result = r;
                }
            }
        }
        result
    }
}

impl<B: MapBackend> Drop for VconChannel<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::warn!("console channel release failed: {e}");
        }
    }
}

fn map_window<B: MapBackend>(
    mem: &mut PciMem<B>,
    path: &str,
    offset: u64,
    length: u64,
) -> Result<MappingInfo> {
    let mut info = mem.init(path)?;
    if let Err(e) = mem.map_base(&mut info, offset, length) {
        if let Err(close_err) = mem.close(&mut info) {
            tracing::warn!("{path}: close after failed map: {close_err}");
        }
        return Err(e);
    }
    Ok(info)
}

fn release<B: MapBackend>(mem: &mut PciMem<B>, info: &mut MappingInfo) {
    if let Err(e) = mem.deinit(info) {
        tracing::warn!("{}: release failed: {e}", info.device_id());
    }
}

fn read_header<B: MapBackend>(mem: &PciMem<B>, info: &MappingInfo) -> Result<SpoolHeader> {
    let mut raw = [0u8; HEADER_SIZE];
    mem.block_read(info, SPOOL_BAR2_OFFSET, &mut raw)?;
    SpoolHeader::parse(&raw)
}
