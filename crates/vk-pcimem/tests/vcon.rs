//! Log spool, console dump and command channel

use std::io::Write;
use std::time::Duration;
use vk_chip::vcon::{console, DEFAULT_MAP_SIZE, MARKER, MAX_MAP_SIZE, SPOOL_BAR2_OFFSET};
use vk_pcimem::vcon::{
    parse_console, parse_spool, read_spool, CommandPoll, SpoolHeader, VconChannel,
};
use vk_pcimem::{MemoryBackend, PciMem, PciMemError, RangeError};

const BAR0: &str = "/sys/class/misc/bcm-vk.0/pci/resource0";
const BAR2: &str = "/sys/class/misc/bcm-vk.0/pci/resource4";
#[allow(clippy::cast_possible_truncation)]
const SPOOL: usize = SPOOL_BAR2_OFFSET as usize;
const BAR2_SIZE: usize = SPOOL + MAX_MAP_SIZE as usize;

const CMD_OFF: u32 = 0x18;
const SPOOL_OFF: u32 = 0x100;

fn header(nentries: u32, len: u32, idx: u32) -> SpoolHeader {
    SpoolHeader {
        marker: MARKER,
        cmd_off: CMD_OFF,
        spool_nentries: nentries,
        spool_len: len,
        spool_off: SPOOL_OFF,
        spool_idx: idx,
    }
}

fn header_bytes(h: &SpoolHeader) -> Vec<u8> {
    [
        h.marker,
        h.cmd_off,
        h.spool_nentries,
        h.spool_len,
        h.spool_off,
        h.spool_idx,
    ]
    .iter()
    .flat_map(|v| v.to_le_bytes())
    .collect()
}

/// Header plus spool, as it sits at the start of the BAR2 console window
fn spool_image(h: &SpoolHeader, lines: &[(u32, &str)]) -> Vec<u8> {
    let mut image = vec![0u8; usize::try_from(h.spool_extent()).unwrap()];
    image[..24].copy_from_slice(&header_bytes(h));
    for &(index, text) in lines {
        let at = usize::try_from(h.entry_offset(index)).unwrap();
        image[at..at + text.len()].copy_from_slice(text.as_bytes());
    }
    image
}

fn fake_card(image: &[u8]) -> PciMem<MemoryBackend> {
    let mut backend = MemoryBackend::new()
        .device(BAR0, 0x1000)
        .unwrap()
        .device(BAR2, BAR2_SIZE)
        .unwrap();
    assert!(backend.poke(BAR2, SPOOL, image));
    PciMem::with_backend(backend)
}

const FAST: CommandPoll = CommandPoll {
    interval: Duration::from_millis(1),
    max_polls: 2,
};

#[test]
fn spool_is_read_oldest_first() {
    let h = header(8, 32, 2);
    let image = spool_image(
        &h,
        &[
            (0, "zero\n"),
            (1, "one\n"),
            (2, "two\n"),
            (3, "three\n"),
            (4, "four\n"),
            (6, "six\n"),
            (7, "seven\n"),
        ],
    );

    let lines = parse_spool(&image).unwrap();
    let order: Vec<u32> = lines.iter().map(|l| l.index).collect();
    assert_eq!(order, [3, 4, 6, 7, 0, 1, 2]);
    assert_eq!(lines[0].text, "three\n");
    assert_eq!(lines[0].to_string(), "<   3> three\n");
}

#[test]
fn spool_index_at_end_wraps_to_zero() {
    let h = header(4, 16, 3);
    let image = spool_image(&h, &[(0, "a"), (3, "d")]);
    let lines = parse_spool(&image).unwrap();
    assert_eq!(lines.iter().map(|l| l.index).collect::<Vec<_>>(), [0, 3]);
}

#[test]
fn full_length_entry_is_cut_before_last_byte() {
    let h = header(2, 8, 0);
    let image = spool_image(&h, &[(1, "12345678")]);
    let lines = parse_spool(&image).unwrap();
    assert_eq!(lines[0].text, "1234567");
}

#[test]
fn spool_rejects_bad_header_and_short_image() {
    let mut bad = header(8, 32, 0);
    bad.marker = 0;
    let err = parse_spool(&spool_image(&bad, &[])).unwrap_err();
    assert!(matches!(err, PciMemError::InvalidHeader { .. }));

    let good = spool_image(&header(8, 32, 0), &[]);
    let err = parse_spool(&good[..good.len() - 1]).unwrap_err();
    assert!(matches!(err, PciMemError::InvalidHeader { .. }));
}

#[test]
fn spool_dump_file_round_trip() {
    let image = spool_image(&header(4, 32, 0), &[(1, "boot ok\n")]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();

    let bytes = std::fs::read(file.path()).unwrap();
    let lines = parse_spool(&bytes).unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, "boot ok\n");
}

fn console_image(wr: u32) -> Vec<u8> {
    let mut image = vec![0u8; console::MAX_LEN];
    image[4..8].copy_from_slice(&console::DATA_SIZE.to_le_bytes());
    image[8..12].copy_from_slice(&wr.to_le_bytes());
    image
}

#[test]
fn console_wraps_from_write_index() {
    let mut image = console_image(5);
    let end = console::MAX_LEN;
    let data = console::DATA_OFFSET;
    image[end - 2..end].copy_from_slice(b"AB");
    image[data..data + 5].copy_from_slice(b"CDEFG");
    // byte at the write index is not yet valid
    image[data + 5] = b'X';

    assert_eq!(parse_console(&image).unwrap(), "ABCDEFG");
}

#[test]
fn console_dump_file() {
    let mut image = console_image(0);
    let text = b"firmware up\n";
    let data = console::DATA_OFFSET;
    image[data + 1..data + 1 + text.len()].copy_from_slice(text);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    let bytes = std::fs::read(file.path()).unwrap();
    assert_eq!(parse_console(&bytes).unwrap(), "firmware up\n");
}

#[test]
fn truncated_console_dump_terminates() {
    let mut image = console_image(console::DATA_SIZE - 1);
    image.truncate(0x100);
    image[0x20..0x23].copy_from_slice(b"abc");
    assert_eq!(parse_console(&image).unwrap(), "abc");
}

#[test]
fn console_rejects_bad_size() {
    let mut image = console_image(0);
    image[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
    assert!(matches!(
        parse_console(&image).unwrap_err(),
        PciMemError::InvalidHeader { .. }
    ));
}

#[test]
fn channel_dumps_whole_spool() {
    let h = header(8, 32, 1);
    let mut mem = fake_card(&spool_image(&h, &[(0, "old\n"), (1, "newest\n")]));
    let mut chan = VconChannel::open(&mut mem, 0).unwrap();
    assert_eq!(chan.header(), &h);

    let all = chan.dump_all().unwrap();
    let text: Vec<&str> = all.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(text, ["old\n", "newest\n"]);
    // nothing written since open
    assert!(chan.poll_output().unwrap().is_empty());
}

#[test]
fn channel_posts_command_and_times_out() {
    let mut mem = fake_card(&spool_image(&header(8, 32, 0), &[]));
    {
        let mut chan = VconChannel::open(&mut mem, 0).unwrap().with_poll(FAST);
        chan.send_command("").unwrap();
        let err = chan.send_command("cmd 1").unwrap_err();
        assert!(matches!(err, PciMemError::Timeout { duration_ms: 3 }));
        assert_eq!(err.code(), -libc::ETIMEDOUT);

        // flag still set: the firmware never took the first command
        let err = chan.send_command("cmd 2").unwrap_err();
        assert!(matches!(err, PciMemError::Busy));
        assert_eq!(err.code(), -libc::EBUSY);
    }

    let backend = mem.backend();
    let flag_at = SPOOL + CMD_OFF as usize;
    assert_eq!(backend.peek(BAR2, flag_at, 1).unwrap(), [1]);
    assert_eq!(backend.peek(BAR2, flag_at + 1, 6).unwrap(), b"cmd 1\0");
    assert_eq!(backend.peek(BAR0, 0x49C, 4).unwrap(), 0xFFFF_FFF0u32.to_ne_bytes());
    assert_eq!(backend.live_maps(), 0);
    assert_eq!(backend.open_fds(), 0);
}

#[test]
fn long_command_is_truncated() {
    let mut mem = fake_card(&spool_image(&header(8, 32, 0), &[]));
    let long = "x".repeat(300);
    {
        let mut chan = VconChannel::open(&mut mem, 0).unwrap().with_poll(FAST);
        assert!(chan.send_command(&long).is_err());
    }
    let text = mem.backend().peek(BAR2, SPOOL + CMD_OFF as usize + 1, 127).unwrap();
    assert!(text[..126].iter().all(|&b| b == b'x'));
    assert_eq!(text[126], 0);
}

#[test]
fn channel_remaps_large_spool() {
    // 1024 entries of 512 bytes: beyond the default 256 KB window
    let h = header(1024, 512, 1023);
    let mut mem = fake_card(&spool_image(&h, &[(0, "first\n"), (1023, "last\n")]));
    {
        let chan = VconChannel::open(&mut mem, 0).unwrap();
        let lines = chan.dump_all().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "first\n");
        assert_eq!(lines[1].text, "last\n");
    }
    // default window, remapped window, doorbell
    assert_eq!(mem.backend().stats().maps, 3);
    assert_eq!(mem.backend().stats().unmaps, 3);
}

#[test]
fn channel_refuses_oversized_or_dead_console() {
    let mut dead = header(8, 32, 0);
    dead.marker = 0xFFFF_FFFF;
    let mut mem = fake_card(&spool_image(&dead, &[]));
    let err = VconChannel::open(&mut mem, 0).unwrap_err();
    assert!(matches!(err, PciMemError::InvalidHeader { .. }));
    assert_eq!(mem.backend().open_fds(), 0);

    let mut huge = header(4, 512, 0);
    huge.spool_off = u32::try_from(MAX_MAP_SIZE).unwrap();
    assert!(mem.backend_mut().poke(BAR2, SPOOL, &header_bytes(&huge)));
    let err = VconChannel::open(&mut mem, 0).unwrap_err();
    assert!(matches!(err, PciMemError::InvalidHeader { .. }));
    assert_eq!(mem.backend().live_maps(), 0);
}

#[test]
fn live_spool_beyond_window_is_out_of_bounds() {
    let mut corrupt = header(8, 512, 0);
    corrupt.spool_off = 0xFFFF_0000;
    let mut mem = fake_card(&header_bytes(&corrupt));
    let mut info = mem.init(BAR2).unwrap();
    mem.map_base(&mut info, SPOOL_BAR2_OFFSET, DEFAULT_MAP_SIZE).unwrap();

    let err = read_spool(&mem, &info).unwrap_err();
    assert!(matches!(
        err,
        PciMemError::Range(RangeError::OutOfBounds {
            offset: SPOOL_BAR2_OFFSET,
            len: 0xFFFF_1000,
            ..
        })
    ));

    let good = header(4, 32, 0);
    assert!(mem.backend_mut().poke(BAR2, SPOOL, &spool_image(&good, &[(1, "up\n")])));
    let lines = read_spool(&mem, &info).unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, "up\n");
    mem.deinit(&mut info).unwrap();
}
