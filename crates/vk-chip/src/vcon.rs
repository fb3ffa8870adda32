//! Virtual console layout in BAR2.
//!
//! The firmware publishes a logger header at [`SPOOL_BAR2_OFFSET`]:
//!
//! ```text
//! +0x00  marker          0xBEEFCAFE once the firmware is up
//! +0x04  cmd_off         command channel, relative to the header
//! +0x08  spool_nentries  number of spool lines (power of two)
//! +0x0C  spool_len       bytes per spool line, NUL terminated
//! +0x10  spool_off       first spool line, relative to the header
//! +0x14  spool_idx       next line the firmware will write
//! ```
//!
//! The command channel is [`CMD_CHAN_SIZE`] bytes: one busy/free flag byte
//! followed by the command text. The host fills the text, sets the flag, and
//! rings [`crate::bar::regs::CMD_DOORBELL`]; the firmware clears the flag
//! once it has consumed the command.

use std::time::Duration;

/// Header location inside BAR2.
pub const SPOOL_BAR2_OFFSET: u64 = 0x380_0000;

/// Marker the firmware writes once the header is valid.
pub const MARKER: u32 = 0xBEEF_CAFE;

/// Size of the logger header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Default window mapped over the header and spool.
pub const DEFAULT_MAP_SIZE: u64 = 256 * 1024;

/// Upper bound on the spool window.
pub const MAX_MAP_SIZE: u64 = 2 * 1024 * 1024;

/// Sanity bound on `spool_nentries`.
pub const MAX_SPOOL_ENTRIES: u32 = 10 * 1024;

/// Sanity bound on `spool_len`.
pub const MAX_SPOOL_ENTRY_LEN: u32 = 512;

/// Command text capacity (flag byte excluded).
pub const MAX_CMD_SIZE: usize = 127;

/// Command channel size including the flag byte.
pub const CMD_CHAN_SIZE: usize = MAX_CMD_SIZE + 1;

/// Flag value: channel free.
pub const CMD_CHAN_FREE: u8 = 0;

/// Flag value: command pending.
pub const CMD_CHAN_OCCUPIED: u8 = 1;

/// Interval between command-flag polls.
pub const CMD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls before a pending command is declared lost.
pub const CMD_POLL_MAX: u32 = 10;

/// Console command that turns colour escapes in the output off.
pub const COLOR_OFF: &str = "color_off";

/// Console command that turns colour escapes back on.
pub const COLOR_ON: &str = "color_on";

/// Interval between spool polls while following command output.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shortest time command output is followed for.
pub const MIN_FOLLOW_DURATION: Duration = Duration::from_secs(1);

/// Console ring dump layout (`reserved, size, wr, rd`, then data).
pub mod console {
    /// Total ring dump size, header included (1 MB).
    pub const MAX_LEN: usize = 1024 * 1024;

    /// Offset of ring data inside the dump.
    pub const DATA_OFFSET: usize = 16;

    /// Expected `size` header field.
    #[allow(clippy::cast_possible_truncation)]
    pub const DATA_SIZE: u32 = (MAX_LEN - DATA_OFFSET) as u32;
}
