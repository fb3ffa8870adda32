//! Device node naming.
//!
//! The `bcm-vk` driver registers one misc device per card. Each card shows up
//! twice on the host:
//!
//! ```text
//! /dev/bcm_vk.<node>                              control node (ioctl)
//! /sys/class/misc/bcm-vk.<node>/pci/resource<N>   one file per BAR slot (mmap)
//! ```
//!
//! Older drivers used a dash in the control node name (`/dev/bcm-vk.<node>`).

/// Control node prefix.
pub const DEV_NODE: &str = "/dev/bcm_vk";

/// Control node prefix used by legacy drivers.
pub const DEV_NODE_LEGACY: &str = "/dev/bcm-vk";

/// sysfs misc-class prefix.
pub const SYSFS_NODE: &str = "/sys/class/misc/bcm-vk";

/// Resource file stem below a card's sysfs node.
pub const SYS_RESOURCE: &str = "pci/resource";

/// Cards a single host is expected to carry.
pub const MAX_CARDS_PER_HOST: u16 = 12;

/// Largest file accepted for a file-to-BAR transfer (64 MB).
pub const MAX_FILE_SIZE: u64 = 0x400_0000;

/// sysfs resource file for resource slot `slot` of card `node`.
///
/// ```
/// assert_eq!(
///     vk_chip::node::resource_path(3, 4),
///     "/sys/class/misc/bcm-vk.3/pci/resource4"
/// );
/// ```
#[must_use]
pub fn resource_path(node: u16, slot: u16) -> String {
    format!("{SYSFS_NODE}.{node}/{SYS_RESOURCE}{slot}")
}

/// Control node of card `node`.
#[must_use]
pub fn control_path(node: u16) -> String {
    format!("{DEV_NODE}.{node}")
}

/// Legacy control node of card `node`.
#[must_use]
pub fn legacy_control_path(node: u16) -> String {
    format!("{DEV_NODE_LEGACY}.{node}")
}

/// Whether `node` is a plausible card index on one host.
#[must_use]
pub const fn is_valid_node(node: u16) -> bool {
    node < MAX_CARDS_PER_HOST
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_driver_naming() {
        assert_eq!(resource_path(0, 0), "/sys/class/misc/bcm-vk.0/pci/resource0");
        assert_eq!(resource_path(11, 4), "/sys/class/misc/bcm-vk.11/pci/resource4");
        assert_eq!(control_path(2), "/dev/bcm_vk.2");
        assert_eq!(legacy_control_path(2), "/dev/bcm-vk.2");
    }

    #[test]
    fn node_limit() {
        assert!(is_valid_node(0));
        assert!(is_valid_node(MAX_CARDS_PER_HOST - 1));
        assert!(!is_valid_node(MAX_CARDS_PER_HOST));
    }
}
