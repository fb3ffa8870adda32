//! Tests against a real card
//!
//! Run with `cargo test -- --ignored` on a host with a Valkyrie card at node 0
//! and read-write access to its sysfs resource files.

use vk_chip::bar::{regs, Bar};
use vk_chip::node::resource_path;
use vk_pcimem::vcon::VconChannel;
use vk_pcimem::{AccessWidth, MapConfig, PciMem};

#[test]
#[ignore] // Requires hardware
fn test_map_doorbell_register() {
    let mut mem = PciMem::with_config(MapConfig::relaxed());
    let path = resource_path(0, Bar::Registers.resource_slot());
    let win = mem.window(&path, regs::CMD_DOORBELL, 4).expect("map BAR0");
    let value = win.read(regs::CMD_DOORBELL, AccessWidth::Bits32).expect("read doorbell");
    println!("BAR0 {:#x} = {value:#010x}", regs::CMD_DOORBELL);
    win.release().expect("unmap");
}

#[test]
#[ignore] // Requires hardware
fn test_reuse_descriptor_on_real_bar() {
    let mut mem = PciMem::with_config(MapConfig::relaxed());
    let path = resource_path(0, Bar::Shared.resource_slot());
    let mut first = mem.init(&path).expect("open BAR2");
    mem.map_base(&mut first, 0, 0x1000).expect("map BAR2");
    let mut second = mem.init(&path).expect("reopen BAR2");
    assert_eq!(first.fd(), second.fd());
    mem.close(&mut second).expect("close");
    mem.deinit(&mut first).expect("unmap");
}

#[test]
#[ignore] // Requires hardware with running firmware
fn test_dump_console_spool() {
    let mut mem = PciMem::with_config(MapConfig::relaxed());
    let chan = VconChannel::open(&mut mem, 0).expect("open console");
    for line in chan.dump_all().expect("read spool") {
        print!("{line}");
    }
}
