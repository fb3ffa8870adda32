//! BAR layout as seen through sysfs.
//!
//! The card exposes 64-bit BARs, so every BAR occupies two resource slots and
//! BAR `n` is the file `resource{2n}`:
//!
//! ```text
//! BAR  Slot  Purpose
//! ──── ───── ──────────────────────────────────────────────────
//!  0   0     Registers (doorbells, boot status)
//!  1   2     Card memory window
//!  2   4     Shared memory: console ring, log spool, cmd channel
//! ```

/// BAR index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Bar {
    /// BAR0: register space.
    Registers = 0,
    /// BAR1: card memory window.
    Memory = 1,
    /// BAR2: shared memory with the firmware.
    Shared = 2,
}

impl Bar {
    /// BAR number.
    #[must_use]
    pub const fn index(self) -> u16 {
        self as u16
    }

    /// sysfs resource slot carrying this BAR.
    #[must_use]
    pub const fn resource_slot(self) -> u16 {
        2 * self.index()
    }

    /// BAR for a resource slot, if the slot starts one.
    #[must_use]
    pub const fn from_resource_slot(slot: u16) -> Option<Self> {
        match slot {
            0 => Some(Self::Registers),
            2 => Some(Self::Memory),
            4 => Some(Self::Shared),
            _ => None,
        }
    }
}

/// BAR0 registers used by host tools.
pub mod regs {
    /// Console command doorbell.
    pub const CMD_DOORBELL: u64 = 0x49C;

    /// Value written to [`CMD_DOORBELL`] to signal a pending command.
    pub const CMD_DOORBELL_VALUE: u32 = 0xFFFF_FFF0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_doubled() {
        assert_eq!(Bar::Registers.resource_slot(), 0);
        assert_eq!(Bar::Memory.resource_slot(), 2);
        assert_eq!(Bar::Shared.resource_slot(), 4);
    }

    #[test]
    fn slot_round_trip() {
        for bar in [Bar::Registers, Bar::Memory, Bar::Shared] {
            assert_eq!(Bar::from_resource_slot(bar.resource_slot()), Some(bar));
        }
        assert_eq!(Bar::from_resource_slot(1), None);
        assert_eq!(Bar::from_resource_slot(6), None);
    }
}
