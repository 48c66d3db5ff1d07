//! CPU test suite
//!
//! - `instructions.rs`: individual instruction families
//! - `exchange.rs`: exchange-jump and monitor handoff
//! - `stack.rs`: instruction stack and prefetch behaviour

use std::sync::Arc;

use super::*;
use crate::config::Features;
use crate::extended::ExtendedMemory;
use crate::memory::CentralMemory;


/// Memory size used by the test fixtures.
const TEST_MEMORY: u32 = 0o40000;

/// Build a runnable CPU over fresh memory: RA 0, FL covering all of
/// memory, started at P=100B.
fn test_cpu() -> Cpu {
    test_cpu_with_features(Features::SERIES_6X00)
}

fn test_cpu_with_features(features: Features) -> Cpu {
    let cm = Arc::new(CentralMemory::new(TEST_MEMORY));
    let ecs = Arc::new(ExtendedMemory::new(1, 0));
    let gate = ExchangeGate::new();
    let mut cpu = Cpu::new(0, features, cm, ecs, gate);
    cpu.ra = 0;
    cpu.fl = TEST_MEMORY;
    cpu.fl_ecs = 0o100000;
    cpu.p = 0o100;
    cpu.stopped = false;
    cpu
}

/// 15-bit parcel: fm(6) i(3) j(3) k(3).
fn p15(fm: u16, i: u16, j: u16, k: u16) -> u16 {
    (fm << 9) | (i << 6) | (j << 3) | k
}

/// 30-bit instruction as two parcels: fm(6) i(3) j(3) K(18), the top
/// three bits of K riding in the k position.
fn p30(fm: u16, i: u16, j: u16, kfield: u32) -> (u16, u16) {
    let high = p15(fm, i, j, ((kfield >> 15) & 7) as u16);
    let low = (kfield & 0o77777) as u16;
    (high, low)
}

/// Assemble four parcels into an instruction word.
fn word(parcels: [u16; 4]) -> u64 {
    ((parcels[0] as u64) << 45)
        | ((parcels[1] as u64) << 30)
        | ((parcels[2] as u64) << 15)
        | parcels[3] as u64
}

/// NO-pad a word that starts with a 30-bit instruction.
fn word30(fm: u16, i: u16, j: u16, kfield: u32) -> u64 {
    let (high, low) = p30(fm, i, j, kfield);
    word([high, low, p15(0o46, 0, 0, 0), p15(0o46, 0, 0, 0)])
}

/// Store a program at P and run `words` instruction words.
fn run(cpu: &mut Cpu, program: &[u64]) {
    for (offset, w) in program.iter().enumerate() {
        cpu.cm_write(cpu.p + offset as u32, *w).expect("program store");
    }
    for _ in 0..program.len() {
        if cpu.step() {
            break;
        }
    }
}
