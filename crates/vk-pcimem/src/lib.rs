//! PCIe BAR mapping for Valkyrie cards.
//!
//! Maps windows of a card's BARs through the sysfs resource files and gives
//! bounds-checked, width-typed access to them. Every active mapping is
//! recorded in a [`MappingRegistry`] keyed by device and BAR, so a BAR is
//! mapped at most once and its descriptor is shared by everyone using it.
//!
//! ```text
//! device path ──resolve──▶ DeviceBarId ──▶ MappingRegistry
//!                                              ▲
//! PciMem::init ──▶ MappingInfo ──map_base──────┘
//!                      │
//!                      └──▶ read / write / block_read / block_write
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use vk_pcimem::{AccessWidth, PciMem};
//!
//! # fn main() -> vk_pcimem::Result<()> {
//! let mut mem = PciMem::new();
//! let mut info = mem.init("/sys/class/misc/bcm-vk.0/pci/resource0")?;
//! mem.map_base(&mut info, 0x404, 4)?;
//! mem.write(&info, 0x404, 0xFFFF_FFF0, AccessWidth::Bits32)?;
//! let value = mem.read(&info, 0x404, AccessWidth::Bits32)?;
//! mem.deinit(&mut info)?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```
//!
//! Without a card, [`MemoryBackend`] stands in for the device files.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod access;
pub mod backend;
mod config;
mod error;
mod id;
mod mapping;
mod registry;
pub mod vcon;
mod window;

pub use access::AccessWidth;
pub use backend::{BackendKind, BackendStats, MapBackend, MemoryBackend, SysBackend};
pub use config::MapConfig;
pub use error::{ParseError, PciMemError, RangeError, Result};
pub use id::DeviceBarId;
pub use mapping::{MappingInfo, MappingState, PciMem};
pub use registry::{MappingRegistry, RegistryEntry};
pub use window::BarWindow;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AccessWidth, BarWindow, DeviceBarId, MapBackend, MapConfig, MappingInfo, MappingState,
        PciMem, PciMemError, Result,
    };
}
