//! Device/BAR identity
//!
//! Every mapping is keyed by the card's node index and the resource number of
//! the BAR file, both recovered from the device path:
//!
//! ```text
//! /sys/class/misc/bcm-vk.3/pci/resource4
//!                        ^             ^
//!                        node = 3      bar = 4
//! ```

use crate::error::ParseError;
use std::fmt;
use std::str::FromStr;

/// Key identifying one BAR resource file of one card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceBarId {
    /// Card node index
    pub node: u16,
    /// Trailing resource number of the device path
    pub bar: u16,
}

impl DeviceBarId {
    /// Create an id from its parts
    #[must_use]
    pub const fn new(node: u16, bar: u16) -> Self {
        Self { node, bar }
    }

    /// Resolve a device path into its node and BAR numbers.
    ///
    /// The node is the number following the last `.` (hex with a `0x`
    /// prefix, decimal otherwise), read up to the first non-digit. The BAR is
    /// the run of decimal digits ending the path.
    ///
    /// # Errors
    ///
    /// - [`ParseError::TooShort`] for paths of three characters or fewer
    /// - [`ParseError::MissingSeparator`] if the path contains no `.`
    /// - [`ParseError::BadNumber`] if either field is missing, non-numeric
    ///   or does not fit in 16 bits
    pub fn resolve(path: &str) -> Result<Self, ParseError> {
        if path.len() <= 3 {
            return Err(ParseError::TooShort {
                path: path.to_string(),
            });
        }

        let dot = path.rfind('.').ok_or_else(|| ParseError::MissingSeparator {
            path: path.to_string(),
        })?;

        let node_text = &path[dot + 1..];
        let node = parse_leading(node_text).ok_or_else(|| bad_number(path, "node", node_text))?;

        let bar_start = path.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let bar_text = &path[bar_start..];
        let bar = bar_text
            .parse::<u16>()
            .map_err(|_| bad_number(path, "bar", bar_text))?;

        Ok(Self { node, bar })
    }
}

impl FromStr for DeviceBarId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

impl fmt::Display for DeviceBarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}:{:02}", self.node, self.bar)
    }
}

fn bad_number(path: &str, field: &'static str, text: &str) -> ParseError {
    ParseError::BadNumber {
        path: path.to_string(),
        field,
        text: text.to_string(),
    }
}

/// Leading unsigned number of `text`, `strtoul`-style but without octal.
fn parse_leading(text: &str) -> Option<u16> {
    let (radix, body) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(rest) => (16, rest),
        None => (10, text),
    };
    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    let digits = &body[..end];
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sysfs_resource_paths() {
        let id = DeviceBarId::resolve("/sys/class/misc/bcm-vk.5/pci/resource0").unwrap();
        assert_eq!(id, DeviceBarId::new(5, 0));

        let id = DeviceBarId::resolve("/sys/class/misc/bcm-vk.3/pci/resource4").unwrap();
        assert_eq!(id, DeviceBarId::new(3, 4));
    }

    #[test]
    fn resolves_every_node_and_bar_pair() {
        for node in [0u16, 1, 9, 10, 11, 255, 4096, u16::MAX] {
            for bar in [0u16, 1, 2, 4, 10, 65, u16::MAX] {
                let path = format!("/sys/class/misc/bcm-vk.{node}/pci/resource{bar}");
                assert_eq!(
                    DeviceBarId::resolve(&path).unwrap(),
                    DeviceBarId::new(node, bar),
                    "{path}"
                );
            }
        }
    }

    #[test]
    fn hex_node() {
        let id: DeviceBarId = "/dev/bcm-vk.0x1f/resource2".parse().unwrap();
        assert_eq!(id, DeviceBarId::new(0x1f, 2));
    }

    #[test]
    fn uses_last_separator() {
        let id = DeviceBarId::resolve("/opt/v1.0/bcm-vk.7/pci/resource2").unwrap();
        assert_eq!(id, DeviceBarId::new(7, 2));
    }

    #[test]
    fn short_paths_rejected() {
        for path in ["", ".", "a.1", "..."] {
            assert!(matches!(
                DeviceBarId::resolve(path),
                Err(ParseError::TooShort { .. })
            ));
        }
    }

    #[test]
    fn missing_separator() {
        assert!(matches!(
            DeviceBarId::resolve("/dev/bcm_vk3/resource2"),
            Err(ParseError::MissingSeparator { .. })
        ));
    }

    #[test]
    fn bad_numbers_never_panic() {
        let cases = [
            ("/sys/class/misc/bcm-vk.x/pci/resource2", "node"),
            ("/sys/class/misc/bcm-vk./pci/resource2", "node"),
            ("/sys/class/misc/bcm-vk.70000/pci/resource2", "node"),
            ("/sys/class/misc/bcm-vk.0x/pci/resource2", "node"),
            ("/sys/class/misc/bcm-vk.3/pci/resource", "bar"),
            ("/sys/class/misc/bcm-vk.3/pci/resource99999", "bar"),
        ];
        for (path, expected) in cases {
            match DeviceBarId::resolve(path) {
                Err(ParseError::BadNumber { field, .. }) => assert_eq!(field, expected, "{path}"),
                other => panic!("{path}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(DeviceBarId::new(3, 2).to_string(), "0003:02");
    }
}
