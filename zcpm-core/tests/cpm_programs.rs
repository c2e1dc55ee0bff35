//! End-to-end scenarios: small .COM images run against real host files.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use zcpm_core::{CpuMode, Emulator, ExitReason, FileMode, HeadlessConsole, LocalHost};

fn scratch_path(tag: &str) -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("zcpm-e2e-{}-{}-{}", std::process::id(), tag, n))
}

fn emulator() -> Emulator<HeadlessConsole, LocalHost> {
    Emulator::new(HeadlessConsole::new(), LocalHost, CpuMode::Z80)
}

#[test]
fn bdos_print_string_emits_exact_bytes() {
    // MVI C,9 / LXI D,msg / CALL 5 / JP 0 with "HELLO\r\n$" inline.
    let program = [
        0x11, 0x0B, 0x01, // LXI D,010B
        0x0E, 0x09, // MVI C,9
        0xCD, 0x05, 0x00, // CALL 5
        0xC3, 0x00, 0x00, // JMP 0
        b'H', b'E', b'L', b'L', b'O', b'\r', b'\n', b'$',
    ];
    let mut emu = emulator();
    emu.load_image(&program).unwrap();
    let info = emu.run().unwrap();
    assert_eq!(info.reason, ExitReason::WarmBoot);
    assert_eq!(emu.console().output(), b"HELLO\r\n");
}

#[test]
fn sequential_text_write_round_trip() {
    // Make OUT.TXT, write one record whose first ten bytes are
    // "abc\ndef\nxy" followed by ^Z padding, close. The host file must
    // hold exactly those ten bytes.
    let out_path = scratch_path("out");
    let program = [
        0x11, 0x00, 0x02, // LXI D,0200
        0x0E, 0x1A, // MVI C,26 (set DMA)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00, // LXI D,005C
        0x0E, 0x16, // MVI C,22 (make)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00,
        0x0E, 0x15, // MVI C,21 (write sequential)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00,
        0x0E, 0x10, // MVI C,16 (close)
        0xCD, 0x05, 0x00,
        0xC3, 0x00, 0x00, // JMP 0
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("OUT.TXT", &out_path, FileMode::Text, true);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["OUT.TXT".into()]);
    let mut record = [0x1Au8; 128];
    record[..10].copy_from_slice(b"abc\ndef\nxy");
    emu.memory_mut().load_at(0x0200, &record);

    let info = emu.run().unwrap();
    assert_eq!(info.reason, ExitReason::WarmBoot);
    assert_eq!(fs::read(&out_path).unwrap(), b"abc\ndef\nxy");

    fs::remove_file(&out_path).unwrap();
}

#[test]
fn sequential_text_read_expands_line_endings() {
    // Open IN.TXT via a mapping and read one record: host "abc\ndef\n"
    // arrives as "abc\r\ndef\r\n" padded with ^Z.
    let in_path = scratch_path("in");
    fs::write(&in_path, b"abc\ndef\n").unwrap();
    let program = [
        0x11, 0x00, 0x02, // LXI D,0200
        0x0E, 0x1A, // MVI C,26 (set DMA)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00, // LXI D,005C
        0x0E, 0x0F, // MVI C,15 (open)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00,
        0x0E, 0x14, // MVI C,20 (read sequential)
        0xCD, 0x05, 0x00,
        0x32, 0x00, 0x03, // STA 0300
        0xC3, 0x00, 0x00, // JMP 0
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("IN.TXT", &in_path, FileMode::Text, true);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["IN.TXT".into()]);

    emu.run().unwrap();
    assert_eq!(emu.memory().read(0x0300), 0);
    assert_eq!(emu.memory().slice(0x0200, 10), b"abc\r\ndef\r\n");
    assert_eq!(emu.memory().read(0x020A), 0x1A);

    fs::remove_file(&in_path).unwrap();
}

#[test]
fn open_failure_reports_ff() {
    let program = [
        0x11, 0x5C, 0x00, // LXI D,005C
        0x0E, 0x0F, // MVI C,15 (open)
        0xCD, 0x05, 0x00,
        0x32, 0x00, 0x03, // STA 0300
        0xC3, 0x00, 0x00,
    ];
    let mut emu = emulator();
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["NOSUCH.FIL".into()]);
    emu.run().unwrap();
    assert_eq!(emu.memory().read(0x0300), 0xFF);
}

#[test]
fn random_read_seeks_by_record() {
    // Three records of 'A', 'B', 'C'; read record 1 randomly.
    let data_path = scratch_path("rand");
    let mut content = vec![b'A'; 128];
    content.extend(std::iter::repeat(b'B').take(128));
    content.extend(std::iter::repeat(b'C').take(128));
    fs::write(&data_path, &content).unwrap();

    let program = [
        0x11, 0x00, 0x02, // LXI D,0200
        0x0E, 0x1A, // MVI C,26 (set DMA)
        0xCD, 0x05, 0x00,
        0x11, 0x5C, 0x00,
        0x0E, 0x0F, // MVI C,15 (open)
        0xCD, 0x05, 0x00,
        0x3E, 0x01, // MVI A,1
        0x32, 0x7D, 0x00, // STA 007D (FCB R0)
        0x11, 0x5C, 0x00,
        0x0E, 0x21, // MVI C,33 (read random)
        0xCD, 0x05, 0x00,
        0x32, 0x00, 0x03, // STA 0300
        0xC3, 0x00, 0x00,
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("DATA.BIN", &data_path, FileMode::Binary, false);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["DATA.BIN".into()]);

    emu.run().unwrap();
    assert_eq!(emu.memory().read(0x0300), 0);
    assert!(emu.memory().slice(0x0200, 128).iter().all(|&b| b == b'B'));

    fs::remove_file(&data_path).unwrap();
}

#[test]
fn compute_file_size_rounds_up() {
    let data_path = scratch_path("size");
    fs::write(&data_path, vec![0u8; 300]).unwrap();

    let program = [
        0x11, 0x5C, 0x00,
        0x0E, 0x23, // MVI C,35 (compute file size)
        0xCD, 0x05, 0x00,
        0xC3, 0x00, 0x00,
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("BIG.BIN", &data_path, FileMode::Binary, false);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["BIG.BIN".into()]);

    emu.run().unwrap();
    // 300 bytes = 3 records, little-endian in R0..R2 (FCB1 + 33).
    assert_eq!(emu.memory().read(0x007D), 3);
    assert_eq!(emu.memory().read(0x007E), 0);
    assert_eq!(emu.memory().read(0x007F), 0);

    fs::remove_file(&data_path).unwrap();
}

#[test]
fn delete_removes_host_file() {
    let victim = scratch_path("del");
    fs::write(&victim, b"bytes").unwrap();

    let program = [
        0x11, 0x5C, 0x00,
        0x0E, 0x13, // MVI C,19 (delete)
        0xCD, 0x05, 0x00,
        0x32, 0x00, 0x03, // STA 0300
        0xC3, 0x00, 0x00,
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("VICTIM.DAT", &victim, FileMode::Binary, false);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["VICTIM.DAT".into()]);

    emu.run().unwrap();
    assert_eq!(emu.memory().read(0x0300), 0);
    assert!(!victim.exists());
}

#[test]
fn rename_moves_within_directory() {
    let dir = scratch_path("rendir");
    fs::create_dir_all(&dir).unwrap();
    let old_path = dir.join("old.dat");
    fs::write(&old_path, b"payload").unwrap();

    // Rename FCB: old name at 005C, new name at 006C.
    let program = [
        0x11, 0x5C, 0x00,
        0x0E, 0x17, // MVI C,23 (rename)
        0xCD, 0x05, 0x00,
        0x32, 0x00, 0x03,
        0xC3, 0x00, 0x00,
    ];
    let mut emu = emulator();
    emu.resolver
        .add_mapping("OLD.DAT", &old_path, FileMode::Binary, false);
    emu.load_image(&program).unwrap();
    emu.set_command_tail(&["OLD.DAT".into(), "NEW.DAT".into()]);

    emu.run().unwrap();
    assert_eq!(emu.memory().read(0x0300), 0);
    assert!(!old_path.exists());
    assert_eq!(fs::read(dir.join("new.dat")).unwrap(), b"payload");

    fs::remove_dir_all(&dir).unwrap();
}
