//! Mapping configuration

/// How device files are opened and mapped, and whether writes are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapConfig {
    /// Open device files with `O_SYNC`
    pub sync_open: bool,

    /// Map with `MAP_LOCKED` (counts against `RLIMIT_MEMLOCK`)
    pub locked: bool,

    /// Map with `MAP_NORESERVE`
    pub no_reserve: bool,

    /// Read back after every write and fail on mismatch.
    ///
    /// Best effort only: BAR registers may have side effects and not read back
    /// what was written.
    pub verify_writes: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            sync_open: true,
            locked: true,
            no_reserve: true,
            verify_writes: true,
        }
    }
}

impl MapConfig {
    /// No page locking and no write verification.
    ///
    /// For unprivileged users with a small memlock limit, and for register
    /// windows where reads have side effects.
    #[must_use]
    pub const fn relaxed() -> Self {
        Self {
            sync_open: true,
            locked: false,
            no_reserve: true,
            verify_writes: false,
        }
    }

    /// Same configuration with write verification set to `verify`
    #[must_use]
    pub const fn with_verify(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }

    /// Same configuration with page locking set to `locked`
    #[must_use]
    pub const fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }
}
