//! Error types for BAR mapping and access

use crate::id::DeviceBarId;
use thiserror::Error;

/// Result type alias for pcimem operations
pub type Result<T> = std::result::Result<T, PciMemError>;

/// Errors from resolving a device path into a [`DeviceBarId`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Path too short to carry a node and BAR
    #[error("device path {path:?} is too short")]
    TooShort {
        /// Offending path
        path: String,
    },

    /// No `.` between base path and node index
    #[error("device path {path:?} has no '.' before the node index")]
    MissingSeparator {
        /// Offending path
        path: String,
    },

    /// Node or BAR field is not a valid 16-bit number
    #[error("device path {path:?}: invalid {field} number {text:?}")]
    BadNumber {
        /// Offending path
        path: String,
        /// `"node"` or `"bar"`
        field: &'static str,
        /// Text that failed to convert
        text: String,
    },
}

/// Errors from bounds, width and verification checks on an access
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// Access falls outside the mapped window
    #[error("access {offset:#x}+{len:#x} outside window [{start:#x}, {end:#x})")]
    OutOfBounds {
        /// Requested BAR offset
        offset: u64,
        /// Requested length
        len: u64,
        /// First accessible offset
        start: u64,
        /// One past the last accessible offset
        end: u64,
    },

    /// Scalar width other than 1, 2, 4 or 8 bytes
    #[error("unsupported access width: {width} bytes")]
    UnsupportedWidth {
        /// Requested width in bytes
        width: usize,
    },

    /// Mapping request of zero bytes
    #[error("cannot map an empty window")]
    ZeroLength,

    /// Scalar read-back differs from the value written
    #[error("write verify failed at {offset:#x}: wrote {expected:#x}, read {actual:#x}")]
    VerifyMismatch {
        /// BAR offset
        offset: u64,
        /// Value written (truncated to width)
        expected: u64,
        /// Value read back
        actual: u64,
    },

    /// Block read-back differs from the data written
    #[error("block verify failed at {offset:#x}: wrote {expected:#04x}, read {actual:#04x}")]
    BlockVerifyMismatch {
        /// BAR offset of the first differing byte
        offset: u64,
        /// Byte written
        expected: u8,
        /// Byte read back
        actual: u8,
    },
}

/// Errors that can occur while mapping or accessing a BAR
#[derive(Debug, Error)]
pub enum PciMemError {
    /// Device path could not be resolved
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Operating system call failed
    #[error("{op} failed: {source}")]
    Os {
        /// Failing call (`open`, `mmap`, `munmap`, `close`)
        op: &'static str,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Access rejected by bounds, width or verification checks
    #[error(transparent)]
    Range(#[from] RangeError),

    /// Mapping is in the wrong state for the operation
    #[error("invalid mapping state: {state}")]
    InvalidState {
        /// What was wrong
        state: String,
    },

    /// Device/BAR already has an active mapping
    #[error("{id} is already mapped")]
    AlreadyMapped {
        /// Device/BAR in question
        id: DeviceBarId,
    },

    /// No registry entry for the device/BAR
    #[error("no mapping registered for {id}")]
    NotFound {
        /// Device/BAR in question
        id: DeviceBarId,
    },

    /// Console/spool header or image is malformed
    #[error("invalid console header: {reason}")]
    InvalidHeader {
        /// Reason for rejection
        reason: String,
    },

    /// Command channel still holds an unconsumed command
    #[error("command channel busy")]
    Busy,

    /// Firmware did not consume a command in time
    #[error("operation timeout after {duration_ms}ms")]
    Timeout {
        /// Time waited in milliseconds
        duration_ms: u64,
    },
}

impl PciMemError {
    /// Create an OS error for `op`
    pub fn os(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            op,
            source: source.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an invalid header error
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            reason: reason.into(),
        }
    }

    /// Negative errno-style code for callers that report numeric status.
    ///
    /// OS failures carry the underlying errno; everything else maps onto the
    /// closest errno.
    #[must_use]
    pub fn code(&self) -> i32 {
        let errno = match self {
            Self::Os { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Parse(_) | Self::InvalidHeader { .. } => libc::EINVAL,
            Self::Range(
                RangeError::VerifyMismatch { .. } | RangeError::BlockVerifyMismatch { .. },
            ) => libc::EIO,
            Self::Range(RangeError::OutOfBounds { .. }) => libc::ERANGE,
            Self::Range(_) => libc::EINVAL,
            Self::InvalidState { .. } => libc::EBADF,
            Self::AlreadyMapped { .. } | Self::Busy => libc::EBUSY,
            Self::NotFound { .. } => libc::ENOENT,
            Self::Timeout { .. } => libc::ETIMEDOUT,
        };
        -errno
    }
}
