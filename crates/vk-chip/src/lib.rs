//! Host-side model of the Broadcom Valkyrie (VK) PCIe accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It records
//! what the host sees of the card: where the driver exposes it, how its BARs
//! show up as sysfs resource files, and the layout of the shared-memory
//! log spool the firmware keeps in BAR2.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`node`] | Device node / sysfs resource naming, per-host limits |
//! | [`bar`] | BAR numbering, resource slot mapping, BAR0 doorbell |
//! | [`vcon`] | Virtual console spool + command channel layout in BAR2 |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod node;
pub mod vcon;
