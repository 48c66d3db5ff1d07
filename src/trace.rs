//! Trace masks and post-mortem dumps
//!
//! The octal `trace` profile entry selects which components write
//! diagnostic streams: one bit per PPU, plus bits for the two CPUs and
//! the exchange-jump traffic. Fine-grained per-instruction tracing is
//! emitted through the `log` facade at trace level; this module decides
//! who is enabled and renders the register/memory dumps.

use std::fmt::Write as _;

use chrono::Local;

use crate::cpu::Cpu;
use crate::memory::CentralMemory;
use crate::ppu::Ppu;
use crate::words::to_pp_words;

/// Trace mask bit for a PPU.
pub fn ppu_bit(ppu: u8) -> u32 {
    1 << (ppu as u32 & 0o37)
}

/// CPU 0 trace bit.
pub const TRACE_CPU0: u32 = 1 << 29;
/// CPU 1 trace bit.
pub const TRACE_CPU1: u32 = 1 << 30;
/// Exchange-jump trace bit.
pub const TRACE_EXCHANGE: u32 = 1 << 28;

/// Active trace selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceMask(pub u32);

impl TraceMask {
    pub fn traces_ppu(&self, ppu: u8) -> bool {
        self.0 & ppu_bit(ppu) != 0
    }

    pub fn traces_cpu(&self, cpu: usize) -> bool {
        self.0 & if cpu == 0 { TRACE_CPU0 } else { TRACE_CPU1 } != 0
    }

    pub fn traces_exchange(&self) -> bool {
        self.0 & TRACE_EXCHANGE != 0
    }
}

fn dump_header(what: &str) -> String {
    format!(
        "{} dump taken {}\n",
        what,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Render the full CPU register set.
pub fn dump_cpu(cpu: &Cpu) -> String {
    let mut out = dump_header(&format!("CPU{}", cpu.id));

    let _ = writeln!(
        out,
        "P       {:06o}  RA    {:08o}  FL    {:08o}",
        cpu.p, cpu.ra, cpu.fl
    );
    let _ = writeln!(
        out,
        "RAE   {:010o}  FLE {:010o}  MA      {:06o}",
        cpu.ra_ecs, cpu.fl_ecs, cpu.ma
    );
    let _ = writeln!(
        out,
        "EM      {:06o}  EC      {:06o}  {}",
        cpu.exit_mode,
        cpu.exit_condition,
        if cpu.stopped { "STOPPED" } else { "RUNNING" }
    );
    for n in 0..8 {
        let _ = writeln!(
            out,
            "A{0} {1:06o}  B{0} {2:06o}  X{0} {3:020o}",
            n, cpu.a[n], cpu.b[n], cpu.x[n]
        );
    }
    out
}

/// Render a PPU's registers and the first words of its memory.
pub fn dump_ppu(ppu: &Ppu) -> String {
    let mut out = dump_header(&format!("PPU{:02o}", ppu.id));
    let _ = writeln!(out, "P {:04o}  A {:06o}  R {:010o}", ppu.p, ppu.a, ppu.r);

    for base in (0..0o100).step_by(8) {
        let _ = write!(out, "{:04o}  ", base);
        for offset in 0..8 {
            let _ = write!(out, "{:04o} ", ppu.mem[base + offset]);
        }
        let _ = writeln!(out);
    }
    out
}

/// Render a window of central memory, five PP words to the line the way
/// the PPU sees them.
pub fn dump_central(cm: &CentralMemory, start: u32, words: u32) -> String {
    let mut out = dump_header("Central memory");
    for addr in start..start.saturating_add(words) {
        let word = cm.read(addr);
        let pp = to_pp_words(word);
        let _ = writeln!(
            out,
            "{:08o}  {:020o}  {:04o} {:04o} {:04o} {:04o} {:04o}",
            addr, word, pp[0], pp[1], pp[2], pp[3], pp[4]
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Features;
    use crate::cpu::ExchangeGate;
    use crate::extended::ExtendedMemory;
    use std::sync::Arc;

    #[test]
    fn test_mask_bits() {
        let mask = TraceMask(0o17);
        assert!(mask.traces_ppu(0));
        assert!(mask.traces_ppu(3));
        assert!(!mask.traces_ppu(4));
        assert!(!mask.traces_cpu(0));

        let mask = TraceMask(TRACE_CPU0 | TRACE_EXCHANGE);
        assert!(mask.traces_cpu(0));
        assert!(!mask.traces_cpu(1));
        assert!(mask.traces_exchange());
    }

    #[test]
    fn test_cpu_dump_contains_registers() {
        let cm = Arc::new(CentralMemory::new(0o40000));
        let ecs = Arc::new(ExtendedMemory::new(0, 0));
        let mut cpu = Cpu::new(0, Features::SERIES_6X00, cm, ecs, ExchangeGate::new());
        cpu.p = 0o1234;
        cpu.x[5] = 0o777;

        let dump = dump_cpu(&cpu);
        assert!(dump.contains("P       001234"));
        assert!(dump.contains("X5 00000000000000000777"));
        assert!(dump.contains("STOPPED"));
    }

    #[test]
    fn test_ppu_dump_shows_memory() {
        let mut ppu = Ppu::new(3, Features::SERIES_6X00);
        ppu.mem[0] = 0o7777;
        let dump = dump_ppu(&ppu);
        assert!(dump.contains("PPU03"));
        assert!(dump.contains("7777"));
    }

    #[test]
    fn test_central_dump_window() {
        let cm = CentralMemory::new(0o40000);
        cm.write(0o100, 0o1234_5670_1234_5670_1234);
        let dump = dump_central(&cm, 0o100, 2);
        assert!(dump.contains("00000100"));
        assert!(dump.contains("1234 5670 1234 5670 1234"));
    }
}
