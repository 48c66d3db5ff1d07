//! Whole-machine integration tests
//!
//! These drive a configured mainframe through real major cycles: PPU
//! programs talking to devices over channels, and the dual-CPU exchange
//! arbitration.

use tempfile::tempdir;

use crate::config;
use crate::sched::System;

/// A PPU word from opcode and d fields.
fn op(fm: u16, d: u16) -> u16 {
    (fm << 6) | d
}

const TAPE_CHANNEL: u16 = 0o13;

fn profile(tape_path: &str) -> String {
    format!(
        "\
[cyber]
model=CYBER173
memory=200000
pps=12
clock=1
deadstart=deadstart.itest
equipment=equipment.itest

[deadstart.itest]
0000

[equipment.itest]
CO6612,0,0,10
MT669,0,0,13,{}
",
        tape_path
    )
}

#[test]
fn test_ppu_drives_tape_round_trip() {
    let dir = tempdir().unwrap();
    let tape = dir.path().join("scratch.tap");
    let cfg = config::parse(&profile(&tape.display().to_string()), "cyber").unwrap();
    let system = System::new(cfg).unwrap();
    let mut mainframe = system.build_mainframe(0).unwrap();
    mainframe.deadstart();

    // PPU 1: function the tape for write, connect, put three words on
    // the channel, disconnect, then idle.
    {
        let pp = &mut mainframe.ppus[1];
        let program = [
            op(0o14, 3),               // LDN 3: word count for OAM
            op(0o77, TAPE_CHANNEL),    // FNC write
            crate::devices::mt669::FC_WRITE,
            op(0o74, TAPE_CHANNEL),    // ACN
            op(0o73, TAPE_CHANNEL),    // OAM 3,100
            0o0100,
            op(0o75, TAPE_CHANNEL),    // DCN
            op(0o03, 0),               // UJN 0: idle
        ];
        for (addr, &word) in program.iter().enumerate() {
            pp.mem[addr] = word;
        }
        pp.mem[0o100] = 0o101;
        pp.mem[0o101] = 0o102;
        pp.mem[0o102] = 0o103;
        pp.p = 0;
    }

    for _ in 0..40 {
        mainframe.cycle();
    }
    // The PPU reached its idle loop; the record is on the image.
    assert_eq!(mainframe.ppus[1].p, 7);

    // Second program on another PPU: rewind, read the record back.
    {
        let pp = &mut mainframe.ppus[2];
        let program = [
            op(0o77, TAPE_CHANNEL), // FNC rewind
            crate::devices::mt669::FC_REWIND,
            op(0o14, 0o10),         // LDN 10: generous word count
            op(0o77, TAPE_CHANNEL), // FNC read forward
            crate::devices::mt669::FC_READ_FWD,
            op(0o74, TAPE_CHANNEL), // ACN
            op(0o71, TAPE_CHANNEL), // IAM 10,200
            0o0200,
            op(0o03, 0), // UJN 0: idle
        ];
        for (addr, &word) in program.iter().enumerate() {
            pp.mem[addr] = word;
        }
        pp.p = 0;
    }

    for _ in 0..60 {
        mainframe.cycle();
    }

    let pp = &mainframe.ppus[2];
    assert_eq!(pp.p, 8);
    assert_eq!(pp.mem[0o200], 0o101);
    assert_eq!(pp.mem[0o201], 0o102);
    assert_eq!(pp.mem[0o202], 0o103);
    // Three of the ten requested words arrived before the record ended.
    assert_eq!(pp.a & 0o777777, 0o10 - 3);
}

#[test]
fn test_single_word_channel_round_trip_latency() {
    // A word put on an idle channel is consumed by the device on the
    // same cycle's channel step, and a reply appears within a few major
    // cycles - the device-side delay counters account for the rest.
    let dir = tempdir().unwrap();
    let tape = dir.path().join("latency.tap");
    let cfg = config::parse(&profile(&tape.display().to_string()), "cyber").unwrap();
    let system = System::new(cfg).unwrap();
    let mut mainframe = system.build_mainframe(0).unwrap();
    mainframe.deadstart();

    // PPU 1 asks for tape status and reads one word.
    {
        let pp = &mut mainframe.ppus[1];
        let program = [
            op(0o77, TAPE_CHANNEL), // FNC general status
            crate::devices::mt669::FC_GENERAL_STATUS,
            op(0o74, TAPE_CHANNEL), // ACN
            op(0o70, TAPE_CHANNEL), // IAN
            op(0o03, 0),            // UJN 0
        ];
        for (addr, &word) in program.iter().enumerate() {
            pp.mem[addr] = word;
        }
        pp.p = 0;
    }

    let start = mainframe.rtc.cycles();
    let mut done_at = None;
    for _ in 0..10 {
        mainframe.cycle();
        if mainframe.ppus[1].p == 4 && done_at.is_none() {
            done_at = Some(mainframe.rtc.cycles());
        }
    }

    let done_at = done_at.expect("status word arrived");
    assert!(done_at - start <= 4, "took {} cycles", done_at - start);
    // Status word landed in A: the unit is loaded and ready.
    assert!(mainframe.ppus[1].a & crate::devices::mt669::ST_READY as u32 != 0);
}

#[test]
fn test_dual_cpu_monitor_arbitration() {
    let dir = tempdir().unwrap();
    let tape = dir.path().join("dual.tap");
    let text = profile(&tape.display().to_string()).replace("pps=12", "pps=12\ncpus=2");
    let cfg = config::parse(&text, "cyber").unwrap();
    let system = System::new(cfg).unwrap();
    let mut mainframe = system.build_mainframe(0).unwrap();
    let mut cpu1 = mainframe.cpu1.take().expect("dual CPU configuration");

    // Both CPUs runnable over the whole field.
    for cpu in [&mut mainframe.cpu0, &mut cpu1] {
        cpu.ra = 0;
        cpu.fl = 0o200000;
        cpu.stopped = false;
    }

    let nop = 0o46000u64;
    let nops = (nop << 45) | (nop << 30) | (nop << 15) | nop;
    // XJ K as the leading 30-bit instruction, NOs behind it.
    let xj = (0o1300u64 << 45) | (nop << 15) | nop;
    let xj_exit = (0o1300u64 << 45) | (0o2000u64 << 30) | (nop << 15) | nop;

    // CPU 0 claims the monitor via XJ at MA=2000B; its user context is
    // parked there.
    mainframe.cpu0.ma = 0o2000;
    mainframe.cm.write(0o2000, 0o3000u64 << 36); // monitor P
    mainframe.cm.write(0o2002, 0o2000u64 << 36); // monitor FL
    mainframe.cm.write(0o3000, nops);
    mainframe.cm.write(0o3001, nops);
    mainframe.cm.write(0o100, xj);
    mainframe.cpu0.p = 0o100;

    mainframe.cpu0.step();
    assert_eq!(mainframe.gate.monitor_cpu(), 0);
    let p0_monitor = mainframe.cpu0.p;
    assert_eq!(p0_monitor, 0o3000);

    // CPU 1 attempts XJ while CPU 0 is the monitor: the instruction
    // stalls, and no register of CPU 0 moves.
    cpu1.ma = 0o2100;
    mainframe.cm.write(0o200, xj);
    cpu1.p = 0o200;
    cpu1.step();
    assert_eq!(cpu1.p, 0o200, "XJ must stall while another CPU is monitor");
    assert_eq!(mainframe.gate.monitor_cpu(), 0);

    // CPU 0 exits monitor mode back to the package it came in on;
    // CPU 1's retry then succeeds.
    mainframe.cm.write(0o3000, xj_exit);
    mainframe.cpu0.step();
    assert_eq!(mainframe.gate.monitor_cpu(), -1);

    mainframe.cm.write(0o2100, 0o4000u64 << 36); // cpu1 monitor P
    mainframe.cm.write(0o2102, 0o2000u64 << 36);
    mainframe.cm.write(0o4000, nops);
    cpu1.step();
    assert_eq!(mainframe.gate.monitor_cpu(), 1);
    assert_eq!(cpu1.p, 0o4000);

    // Both CPUs' P advanced monotonically through their own programs
    // and neither touched the other's registers.
    assert_ne!(mainframe.cpu0.p, cpu1.p);
}

#[test]
fn test_ppu_exchange_restarts_cpu_from_memory_image() {
    // A PPU builds an exchange package with CWD writes, then issues EXN;
    // the CPU wakes at the package's P.
    let dir = tempdir().unwrap();
    let tape = dir.path().join("exn.tap");
    let cfg = config::parse(&profile(&tape.display().to_string()), "cyber").unwrap();
    let system = System::new(cfg).unwrap();
    let mut mainframe = system.build_mainframe(0).unwrap();
    mainframe.deadstart();

    // Package word 0: P = 500B in the upper 18 bits.
    let package_word0 = crate::words::to_pp_words(0o500u64 << 36);
    {
        let pp = &mut mainframe.ppus[3];
        for (addr, &word) in package_word0.iter().enumerate() {
            pp.mem[0o50 + addr] = word;
        }
        let program = [
            op(0o20, 0), // LDC 1000B: package address
            0o1000,
            op(0o62, 0o50), // CWD 50: write package word 0
            op(0o26, 0),    // EXN
            op(0o03, 0),    // UJN 0
        ];
        for (addr, &word) in program.iter().enumerate() {
            pp.mem[addr] = word;
        }
        pp.p = 0;
    }
    // FL for the incoming context.
    mainframe.cm.write(0o1002, 0o2000u64 << 36);
    let nop = 0o46000u64;
    let nops = (nop << 45) | (nop << 30) | (nop << 15) | nop;
    let jump = (0o2000u64 << 45) | (0o500u64 << 30) | (nop << 15) | nop;
    mainframe.cm.write(0o500, nops);
    mainframe.cm.write(0o501, jump);

    assert!(mainframe.cpu0.stopped);
    for _ in 0..10 {
        mainframe.cycle();
    }
    assert!(!mainframe.cpu0.stopped);
    assert!((0o500..=0o501).contains(&mainframe.cpu0.p));
    assert_eq!(mainframe.gate.monitor_cpu(), 0);
}
