//! Peripheral processors
//!
//! Each PPU is a 12-bit processor with 4096 words of local memory and an
//! 18-bit A register. PPUs are the only agents that drive channels; the
//! CRD/CRM/CWD/CWM opcodes give them a window into central (and extended)
//! memory.
//!
//! # Stepping discipline
//!
//! `step` executes at most one instruction. An I/O opcode that finds its
//! channel not ready does not advance P - it re-executes on the next major
//! cycle. Block transfers (IAM/OAM) keep their progress in the `location`
//! register and the A count and resume across cycles the same way. A PPU
//! therefore never blocks the scheduler thread.

use log::{trace, warn};

use crate::channel::Channel;
use crate::config::Features;
use crate::cpu::{ExchangeGate, XjSource};
use crate::device::FcStatus;
use crate::extended::ExtendedMemory;
use crate::memory::CentralMemory;
use crate::words::{add18, from_pp_words, sub18, to_pp_words, PpWord, MASK12, MASK18};

/// PPU memory size in words.
pub const PP_MEM_SIZE: usize = 4096;

/// Everything outside the PPU that an instruction can touch.
pub struct PpuEnv<'a> {
    pub channels: &'a mut [Channel],
    pub cm: &'a CentralMemory,
    pub ecs: &'a ExtendedMemory,
    pub gate: &'a ExchangeGate,
    /// Number of CPUs on this mainframe (EXN/RPN target selection).
    pub cpus: usize,
}

/// How an instruction left the program counter.
enum Outcome {
    /// Advance past the instruction (1 or 2 words).
    Advance,
    /// Jump to an absolute PP address.
    Jump(PpWord),
    /// Channel not ready: re-execute the instruction next cycle.
    Wait,
}

/// One peripheral processor.
pub struct Ppu {
    /// PPU number on its mainframe.
    pub id: u8,
    /// Program counter, 12 bits.
    pub p: PpWord,
    /// Accumulator, 18 bits.
    pub a: u32,
    /// Relocation register for extended-memory transfers, 28 bits.
    pub r: u32,
    /// Local memory, 4096 x 12 bits.
    pub mem: Box<[PpWord; PP_MEM_SIZE]>,
    /// Resume pointer for a block transfer in flight.
    location: PpWord,
    /// A block transfer is in flight (location is valid).
    transfer_active: bool,
    features: Features,
}

impl Ppu {
    pub fn new(id: u8, features: Features) -> Self {
        Self {
            id,
            p: 0,
            a: 0,
            r: 0,
            mem: Box::new([0; PP_MEM_SIZE]),
            location: 0,
            transfer_active: false,
            features,
        }
    }

    /// Reset to the deadstart state.
    pub fn reset(&mut self) {
        self.p = 0;
        self.a = 0;
        self.r = 0;
        self.mem.fill(0);
        self.location = 0;
        self.transfer_active = false;
    }

    fn read_mem(&self, addr: PpWord) -> PpWord {
        self.mem[addr as usize % PP_MEM_SIZE]
    }

    fn write_mem(&mut self, addr: PpWord, word: PpWord) {
        self.mem[addr as usize % PP_MEM_SIZE] = word & MASK12 as PpWord;
    }

    /// Memory-mode effective address: m, indexed by (d) when d is nonzero.
    fn memory_address(&self, d: PpWord, m: PpWord) -> PpWord {
        if d == 0 {
            m & MASK12 as PpWord
        } else {
            (m + self.read_mem(d)) & MASK12 as PpWord
        }
    }

    /// 6-bit signed displacement for the short jumps.
    fn signed6(d: PpWord) -> i32 {
        if d & 0o40 != 0 {
            d as i32 - 0o100
        } else {
            d as i32
        }
    }

    fn relative_jump(&self, d: PpWord) -> PpWord {
        ((self.p as i32 + Self::signed6(d)) & MASK12 as i32) as PpWord
    }

    /// Execute one instruction.
    pub fn step(&mut self, env: &mut PpuEnv) {
        let opcode = self.read_mem(self.p);
        let fm = (opcode >> 6) & 0o77;
        let d = opcode & 0o77;
        // Second instruction word; only two-word opcodes look at it.
        let m = self.read_mem((self.p + 1) & MASK12 as PpWord);

        trace!("pp{:02o}: P={:04o} fm={:02o} d={:02o}", self.id, self.p, fm, d);

        // SCF/CCF take a second word only on models that have the
        // channel flag register; they are one-word passes elsewhere.
        let two_words = matches!(
            fm,
            0o01 | 0o02
                | 0o20..=0o23
                | 0o50..=0o57
                | 0o61 | 0o63
                | 0o64..=0o67
                | 0o71 | 0o73
                | 0o77
        ) || (matches!(fm, 0o24 | 0o25)
            && self.features.contains(Features::CHANNEL_FLAG));

        let outcome = match fm {
            0o00 => Outcome::Advance,                       // PSN
            0o01 => Outcome::Jump(self.memory_address(d, m)), // LJM
            0o02 => {
                // RJM: plant the return address, continue behind it.
                let target = self.memory_address(d, m);
                let ret = (self.p + 2) & MASK12 as PpWord;
                self.write_mem(target, ret);
                Outcome::Jump((target + 1) & MASK12 as PpWord)
            }
            0o03 => Outcome::Jump(self.relative_jump(d)),   // UJN
            0o04 => self.cond_jump(d, self.a & MASK18 as u32 == 0), // ZJN
            0o05 => self.cond_jump(d, self.a & MASK18 as u32 != 0), // NJN
            0o06 => self.cond_jump(d, self.a & 0o400000 == 0), // PJN
            0o07 => self.cond_jump(d, self.a & 0o400000 != 0), // MJN
            0o10 => {
                // SHN: positive left circular, else right end-off.
                if d < 0o40 {
                    let count = (d as u32) % 18;
                    self.a = ((self.a << count) | (self.a >> (18 - count))) & MASK18 as u32;
                } else {
                    let count = 0o100 - d as u32;
                    self.a = if count >= 18 { 0 } else { self.a >> count };
                }
                Outcome::Advance
            }
            0o11 => {
                self.a ^= d as u32; // LMN
                Outcome::Advance
            }
            0o12 => {
                self.a &= d as u32; // LPN
                Outcome::Advance
            }
            0o13 => {
                self.a &= !(d as u32) & MASK18 as u32; // SCN
                Outcome::Advance
            }
            0o14 => {
                self.a = d as u32; // LDN
                Outcome::Advance
            }
            0o15 => {
                self.a = !(d as u32) & MASK18 as u32; // LCN
                Outcome::Advance
            }
            0o16 => {
                self.a = add18(self.a, d as u32); // ADN
                Outcome::Advance
            }
            0o17 => {
                self.a = sub18(self.a, d as u32); // SBN
                Outcome::Advance
            }
            0o20 => {
                self.a = ((d as u32) << 12) | m as u32; // LDC
                Outcome::Advance
            }
            0o21 => {
                self.a = add18(self.a, ((d as u32) << 12) | m as u32); // ADC
                Outcome::Advance
            }
            0o22 => {
                self.a &= ((d as u32) << 12) | m as u32; // LPC
                Outcome::Advance
            }
            0o23 => {
                self.a ^= ((d as u32) << 12) | m as u32; // LMC
                Outcome::Advance
            }
            0o24 | 0o25 => {
                // SCF/CCF where the flag register exists, pass elsewhere.
                if self.features.contains(Features::CHANNEL_FLAG) {
                    self.op_channel_flag(fm, d, m, env)
                } else {
                    Outcome::Advance
                }
            }
            0o26 => self.op_exn(d, env),                   // EXN
            0o27 => {
                // RPN: read the selected CPU's P register.
                let cpu = (d as usize) & 1;
                let cpu = if cpu < env.cpus { cpu } else { 0 };
                self.a = env.gate.cpu_p(cpu) & MASK18 as u32;
                Outcome::Advance
            }
            0o30 => {
                self.a = self.read_mem(d) as u32; // LDD
                Outcome::Advance
            }
            0o31 => {
                self.a = add18(self.a, self.read_mem(d) as u32); // ADD
                Outcome::Advance
            }
            0o32 => {
                self.a = sub18(self.a, self.read_mem(d) as u32); // SBD
                Outcome::Advance
            }
            0o33 => {
                self.a ^= self.read_mem(d) as u32; // LMD
                Outcome::Advance
            }
            0o34 => {
                self.write_mem(d, self.a as PpWord); // STD
                Outcome::Advance
            }
            0o35 => {
                // RAD: replace add.
                self.a = add18(self.a, self.read_mem(d) as u32);
                self.write_mem(d, self.a as PpWord);
                Outcome::Advance
            }
            0o36 => {
                // AOD: replace add one.
                self.a = add18(self.read_mem(d) as u32, 1);
                self.write_mem(d, self.a as PpWord);
                Outcome::Advance
            }
            0o37 => {
                // SOD: replace subtract one.
                self.a = sub18(self.read_mem(d) as u32, 1);
                self.write_mem(d, self.a as PpWord);
                Outcome::Advance
            }
            0o40..=0o47 => {
                // Indirect forms of 30-37.
                let addr = self.read_mem(d);
                self.alu_memory(fm & 7, addr)
            }
            0o50..=0o57 => {
                // Memory forms of 30-37.
                let addr = self.memory_address(d, m);
                self.alu_memory(fm & 7, addr)
            }
            0o60 => self.op_crd(d, env),
            0o61 => self.op_crm(d, m, env),
            0o62 => self.op_cwd(d, env),
            0o63 => self.op_cwm(d, m, env),
            0o64..=0o67 => self.op_channel_jump(fm, d, m, env),
            0o70 => self.op_ian(d, env),
            0o71 => self.op_iam(d, m, env),
            0o72 => self.op_oan(d, env),
            0o73 => self.op_oam(d, m, env),
            0o74 => self.op_acn(d, env),
            0o75 => self.op_dcn(d, env),
            0o76 => self.op_fan(d, self.a as PpWord & MASK12 as PpWord, env),
            0o77 => self.op_fan(d, m, env),
            _ => unreachable!("fm is 6 bits"),
        };

        self.a &= MASK18 as u32;
        match outcome {
            Outcome::Advance => {
                let len = if two_words { 2 } else { 1 };
                self.p = (self.p + len) & MASK12 as PpWord;
            }
            Outcome::Jump(target) => self.p = target,
            Outcome::Wait => {}
        }
    }

    fn cond_jump(&self, d: PpWord, take: bool) -> Outcome {
        if take {
            Outcome::Jump(self.relative_jump(d))
        } else {
            Outcome::Advance
        }
    }

    /// Shared body for the direct/indirect/memory ALU forms.
    fn alu_memory(&mut self, low: PpWord, addr: PpWord) -> Outcome {
        match low {
            0 => self.a = self.read_mem(addr) as u32,
            1 => self.a = add18(self.a, self.read_mem(addr) as u32),
            2 => self.a = sub18(self.a, self.read_mem(addr) as u32),
            3 => self.a ^= self.read_mem(addr) as u32,
            4 => self.write_mem(addr, self.a as PpWord),
            5 => {
                self.a = add18(self.a, self.read_mem(addr) as u32);
                self.write_mem(addr, self.a as PpWord);
            }
            6 => {
                self.a = add18(self.read_mem(addr) as u32, 1);
                self.write_mem(addr, self.a as PpWord);
            }
            _ => {
                self.a = sub18(self.read_mem(addr) as u32, 1);
                self.write_mem(addr, self.a as PpWord);
            }
        }
        Outcome::Advance
    }

    // ========== Central / extended memory transfers ==========

    /// Bit 17 of a transfer address selects extended memory through the
    /// relocation register on models that have one.
    fn is_ecs_address(&self, rel: u32) -> bool {
        self.features.has_relocation_reg() && rel & 0o400000 != 0
    }

    fn read_central(&self, env: &PpuEnv, rel: u32) -> u64 {
        if self.is_ecs_address(rel) {
            let addr = (self.r << 6).wrapping_add(rel & 0o377777);
            env.ecs.read(addr).unwrap_or(0)
        } else {
            env.cm.read(rel)
        }
    }

    fn write_central(&self, env: &PpuEnv, rel: u32, word: u64) {
        if self.is_ecs_address(rel) {
            let addr = (self.r << 6).wrapping_add(rel & 0o377777);
            if env.ecs.write(addr, word).is_err() {
                warn!("pp{:02o}: extended memory write out of range", self.id);
            }
        } else {
            env.cm.write(rel, word);
        }
    }

    /// CRD: one central word into five PP words at d.
    fn op_crd(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let word = self.read_central(env, self.a & MASK18 as u32);
        for (offset, pp) in to_pp_words(word).into_iter().enumerate() {
            self.write_mem(d + offset as PpWord, pp);
        }
        Outcome::Advance
    }

    /// CRM: (d) central words from (A) into PP memory at m.
    fn op_crm(&mut self, d: PpWord, m: PpWord, env: &mut PpuEnv) -> Outcome {
        let count = self.read_mem(d) as u32;
        let mut dest = m;
        for offset in 0..count {
            let word = self.read_central(env, add18(self.a, offset) & MASK18 as u32);
            for pp in to_pp_words(word) {
                self.write_mem(dest, pp);
                dest = (dest + 1) & MASK12 as PpWord;
            }
        }
        self.a = add18(self.a, count);
        Outcome::Advance
    }

    /// CWD: five PP words at d into one central word.
    fn op_cwd(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let words = [
            self.read_mem(d),
            self.read_mem(d + 1),
            self.read_mem(d + 2),
            self.read_mem(d + 3),
            self.read_mem(d + 4),
        ];
        self.write_central(env, self.a & MASK18 as u32, from_pp_words(words));
        Outcome::Advance
    }

    /// CWM: (d) central words from PP memory at m to (A).
    fn op_cwm(&mut self, d: PpWord, m: PpWord, env: &mut PpuEnv) -> Outcome {
        let count = self.read_mem(d) as u32;
        let mut src = m;
        for offset in 0..count {
            let mut words = [0 as PpWord; 5];
            for pp in words.iter_mut() {
                *pp = self.read_mem(src);
                src = (src + 1) & MASK12 as PpWord;
            }
            self.write_central(env, add18(self.a, offset) & MASK18 as u32, from_pp_words(words));
        }
        self.a = add18(self.a, count);
        Outcome::Advance
    }

    // ========== Exchange request ==========

    /// EXN: request a monitor exchange of the selected CPU at the package
    /// address in A. Refused while a monitor exists; the opcode re-executes
    /// until the gate accepts it.
    fn op_exn(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let cpu = (d as usize) & 1;
        let cpu = if cpu < env.cpus { cpu } else { 0 };
        let addr = self.a & MASK18 as u32;
        if env
            .gate
            .request_monitor_exchange(cpu, addr, XjSource::PpuMonitorRequest)
        {
            Outcome::Advance
        } else {
            Outcome::Wait
        }
    }

    // ========== Channel flag ==========

    /// SCF/CCF: the channel-flag interlock for cooperating PPUs. SCF is
    /// a test-and-set that jumps to m when the flag is already held;
    /// CCF releases it.
    fn op_channel_flag(&mut self, fm: PpWord, d: PpWord, m: PpWord, env: &mut PpuEnv) -> Outcome {
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Advance,
        };
        if fm == 0o24 {
            if channel.state.flag {
                Outcome::Jump(m & MASK12 as PpWord)
            } else {
                channel.state.flag = true;
                Outcome::Advance
            }
        } else {
            channel.state.flag = false;
            Outcome::Advance
        }
    }

    // ========== Channel jumps ==========

    fn op_channel_jump(&self, fm: PpWord, d: PpWord, m: PpWord, env: &PpuEnv) -> Outcome {
        let ch = (d as usize) & 0o37;
        let (active, full) = match env.channels.get(ch) {
            Some(channel) => (channel.state.active, channel.state.observed_full()),
            None => (false, false),
        };
        let take = match fm {
            0o64 => active,  // AJM
            0o65 => !active, // IJM
            0o66 => full,    // FJM
            _ => !full,      // EJM
        };
        if take {
            Outcome::Jump(m & MASK12 as PpWord)
        } else {
            Outcome::Advance
        }
    }

    // ========== Channel data transfer ==========

    fn channel<'c>(env: &'c mut PpuEnv, d: PpWord) -> Option<&'c mut Channel> {
        env.channels.get_mut((d as usize) & 0o37)
    }

    /// IAN: wait for a full channel, take the word into A.
    fn op_ian(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Wait,
        };
        if !channel.state.full {
            return Outcome::Wait;
        }
        self.a = channel.input() as u32;
        Outcome::Advance
    }

    /// IAM: block input of (A) words to PP memory at m.
    fn op_iam(&mut self, d: PpWord, m: PpWord, env: &mut PpuEnv) -> Outcome {
        if !self.transfer_active {
            self.location = m & MASK12 as PpWord;
            self.transfer_active = true;
        }

        loop {
            let channel = match Self::channel(env, d) {
                Some(channel) => channel,
                None => return Outcome::Wait,
            };

            if self.a & MASK18 as u32 == 0 {
                self.transfer_active = false;
                return Outcome::Advance;
            }
            if !channel.state.active {
                // Disconnect mid-transfer terminates the instruction with
                // a zero word at the current location; A keeps the count
                // of words not delivered.
                let location = self.location;
                self.write_mem(location, 0);
                self.transfer_active = false;
                return Outcome::Advance;
            }
            if !channel.state.full {
                return Outcome::Wait;
            }

            let word = channel.input();
            let location = self.location;
            self.write_mem(location, word);
            self.location = (self.location + 1) & MASK12 as PpWord;
            self.a = sub18(self.a, 1);
        }
    }

    /// OAN: wait for an empty channel, put A on it.
    fn op_oan(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Wait,
        };
        if !channel.state.active || channel.state.full {
            return Outcome::Wait;
        }
        channel.output(self.a as PpWord & MASK12 as PpWord);
        Outcome::Advance
    }

    /// OAM: block output of (A) words from PP memory at m.
    fn op_oam(&mut self, d: PpWord, m: PpWord, env: &mut PpuEnv) -> Outcome {
        if !self.transfer_active {
            self.location = m & MASK12 as PpWord;
            self.transfer_active = true;
        }

        loop {
            let channel = match Self::channel(env, d) {
                Some(channel) => channel,
                None => return Outcome::Wait,
            };

            if self.a & MASK18 as u32 == 0 {
                self.transfer_active = false;
                return Outcome::Advance;
            }
            if !channel.state.active {
                self.transfer_active = false;
                return Outcome::Advance;
            }
            if channel.state.full {
                return Outcome::Wait;
            }

            let word = self.read_mem(self.location);
            channel.output(word);
            self.location = (self.location + 1) & MASK12 as PpWord;
            self.a = sub18(self.a, 1);
        }
    }

    /// ACN: activate the channel; waits while it is already active.
    fn op_acn(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Wait,
        };
        if channel.state.active {
            return Outcome::Wait;
        }
        channel.activate();
        Outcome::Advance
    }

    /// DCN: disconnect the channel; waits while it is inactive.
    fn op_dcn(&mut self, d: PpWord, env: &mut PpuEnv) -> Outcome {
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Wait,
        };
        if !channel.state.active {
            return Outcome::Wait;
        }
        channel.disconnect();
        Outcome::Advance
    }

    /// FAN/FNC: present a function code on an inactive channel.
    fn op_fan(&mut self, d: PpWord, code: PpWord, env: &mut PpuEnv) -> Outcome {
        let id = self.id;
        let channel = match Self::channel(env, d) {
            Some(channel) => channel,
            None => return Outcome::Wait,
        };
        if channel.state.active {
            return Outcome::Wait;
        }
        match channel.function(code) {
            FcStatus::Accepted | FcStatus::Processed => Outcome::Advance,
            FcStatus::Declined => {
                warn!(
                    "pp{:02o}: function {:04o} declined on channel {:02o}",
                    id,
                    code,
                    channel.state.id
                );
                Outcome::Advance
            }
        }
    }
}

/// Step every PPU once, round-robin, then all channels. Channel stepping
/// directly after the PPUs makes any channel change a PPU made this cycle
/// visible to its device in the same cycle.
pub fn step_all(ppus: &mut [Ppu], env: &mut PpuEnv) {
    for ppu in ppus.iter_mut() {
        ppu.step(env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::init_channels;
    use crate::cpu::ExchangeGate;
    use crate::device::{Device, DeviceKind};
    use std::sync::Arc;

    struct Fixture {
        channels: Vec<Channel>,
        cm: Arc<CentralMemory>,
        ecs: Arc<ExtendedMemory>,
        gate: Arc<ExchangeGate>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                channels: init_channels(0o14),
                cm: Arc::new(CentralMemory::new(0o40000)),
                ecs: Arc::new(ExtendedMemory::new(0, 0)),
                gate: ExchangeGate::new(),
            }
        }

        fn env(&mut self) -> PpuEnv<'_> {
            PpuEnv {
                channels: &mut self.channels,
                cm: &self.cm,
                ecs: &self.ecs,
                gate: &self.gate,
                cpus: 1,
            }
        }
    }

    fn ppu() -> Ppu {
        Ppu::new(1, Features::SERIES_6X00)
    }

    fn flag_ppu() -> Ppu {
        Ppu::new(1, Features::SERIES_800 | Features::CHANNEL_FLAG)
    }

    fn op(fm: u16, d: u16) -> PpWord {
        (fm << 6) | d
    }

    #[test]
    fn test_load_and_add() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o14, 0o25); // LDN 25
        pp.mem[1] = op(0o16, 0o3); // ADN 3
        pp.step(&mut fx.env());
        pp.step(&mut fx.env());
        assert_eq!(pp.a, 0o30);
        assert_eq!(pp.p, 2);
    }

    #[test]
    fn test_load_complement() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o15, 0o25); // LCN 25
        pp.step(&mut fx.env());
        assert_eq!(pp.a, !0o25u32 & 0o777777);
    }

    #[test]
    fn test_long_constant() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o20, 0o12); // LDC 12xxxx
        pp.mem[1] = 0o3456;
        pp.step(&mut fx.env());
        assert_eq!(pp.a, 0o123456);
        assert_eq!(pp.p, 2);
    }

    #[test]
    fn test_store_direct_and_indirect() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.a = 0o7777;
        pp.mem[0] = op(0o34, 0o10); // STD 10
        pp.mem[1] = op(0o44, 0o11); // STI 11
        pp.mem[0o11] = 0o20;
        pp.step(&mut fx.env());
        pp.step(&mut fx.env());
        assert_eq!(pp.mem[0o10], 0o7777);
        assert_eq!(pp.mem[0o20], 0o7777);
    }

    #[test]
    fn test_replace_add_one() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0o30] = 5;
        pp.mem[0] = op(0o36, 0o30); // AOD 30
        pp.step(&mut fx.env());
        assert_eq!(pp.mem[0o30], 6);
        assert_eq!(pp.a, 6);
    }

    #[test]
    fn test_short_jumps() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.p = 0o100;
        pp.mem[0o100] = op(0o03, 0o5); // UJN +5
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o105);

        pp.mem[0o105] = op(0o03, 0o75); // UJN -3
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o102);
    }

    #[test]
    fn test_conditional_jumps() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.a = 0;
        pp.mem[0] = op(0o04, 0o3); // ZJN +3
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 3);

        pp.a = 0o400001; // negative 18-bit value
        pp.mem[3] = op(0o07, 0o2); // MJN +2
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 5);
    }

    #[test]
    fn test_long_and_return_jumps() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o01, 0); // LJM 500
        pp.mem[1] = 0o500;
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o500);

        pp.mem[0o500] = op(0o02, 0); // RJM 600
        pp.mem[0o501] = 0o600;
        pp.step(&mut fx.env());
        assert_eq!(pp.mem[0o600], 0o502); // return address planted
        assert_eq!(pp.p, 0o601);
    }

    #[test]
    fn test_shift_both_directions() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.a = 1;
        pp.mem[0] = op(0o10, 0o3); // SHN 3: left circular
        pp.step(&mut fx.env());
        assert_eq!(pp.a, 0o10);

        pp.mem[1] = op(0o10, 0o77); // SHN 77: right end-off 1
        pp.step(&mut fx.env());
        assert_eq!(pp.a, 0o4);
    }

    #[test]
    fn test_crd_cwd_round_trip() {
        let mut fx = Fixture::new();
        fx.cm.write(0o1000, 0o1234_5670_1234_5670_1234);
        let mut pp = ppu();
        pp.a = 0o1000;
        pp.mem[0] = op(0o60, 0o20); // CRD 20
        pp.step(&mut fx.env());
        assert_eq!(pp.mem[0o20], 0o1234);
        assert_eq!(pp.mem[0o24], 0o1234);

        // CWD back to another address.
        pp.a = 0o1001;
        pp.mem[1] = op(0o62, 0o20); // CWD 20
        pp.step(&mut fx.env());
        assert_eq!(fx.cm.read(0o1001), 0o1234_5670_1234_5670_1234);
    }

    #[test]
    fn test_crm_block_transfer() {
        let mut fx = Fixture::new();
        fx.cm.write(0o2000, 0o1111);
        fx.cm.write(0o2001, 0o2222);
        let mut pp = ppu();
        pp.a = 0o2000;
        pp.mem[0o77] = 2; // word count
        pp.mem[0] = op(0o61, 0o77); // CRM 77,100
        pp.mem[1] = 0o100;
        pp.step(&mut fx.env());
        // Two central words, five PP words each.
        assert_eq!(pp.mem[0o104], 0o1111);
        assert_eq!(pp.mem[0o111], 0o2222);
        assert_eq!(pp.a, 0o2002); // A advanced past the block
    }

    #[test]
    fn test_channel_output_and_input() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        fx.channels[0o2].activate();

        pp.a = 0o4321;
        pp.mem[0] = op(0o72, 0o2); // OAN 2
        pp.step(&mut fx.env());
        assert!(fx.channels[0o2].state.full);
        assert_eq!(fx.channels[0o2].state.data, 0o4321);
        assert_eq!(pp.p, 1);

        // IAN reads it back (nothing consumed it).
        pp.mem[1] = op(0o70, 0o2); // IAN 2
        pp.step(&mut fx.env());
        assert_eq!(pp.a, 0o4321);
        assert!(!fx.channels[0o2].state.full);
    }

    #[test]
    fn test_ian_waits_for_full() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        fx.channels[0o3].activate();
        pp.mem[0] = op(0o70, 0o3); // IAN 3
        // Channel never becomes full: P must not advance.
        for _ in 0..5 {
            pp.step(&mut fx.env());
            assert_eq!(pp.p, 0);
        }
    }

    #[test]
    fn test_oan_waits_until_consumed() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        fx.channels[0o2].activate();
        fx.channels[0o2].output(0o77); // already full

        pp.a = 1;
        pp.mem[0] = op(0o72, 0o2);
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0); // waiting

        fx.channels[0o2].input(); // consumer drains it
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 1);
    }

    #[test]
    fn test_activate_disconnect() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o74, 0o2); // ACN 2
        pp.mem[1] = op(0o75, 0o2); // DCN 2
        pp.step(&mut fx.env());
        assert!(fx.channels[0o2].state.active);
        pp.step(&mut fx.env());
        assert!(!fx.channels[0o2].state.active);
    }

    #[test]
    fn test_channel_flag_test_and_set() {
        let mut fx = Fixture::new();
        let mut pp = flag_ppu();
        pp.mem[0] = op(0o24, 0o2); // SCF 2,100
        pp.mem[1] = 0o100;
        pp.step(&mut fx.env());
        // Flag was free: claimed, fall through.
        assert!(fx.channels[0o2].state.flag);
        assert_eq!(pp.p, 2);

        // A second SCF finds the flag held and takes the jump.
        pp.mem[2] = op(0o24, 0o2);
        pp.mem[3] = 0o100;
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o100);

        // CCF releases the interlock.
        pp.mem[0o100] = op(0o25, 0o2);
        pp.mem[0o101] = 0;
        pp.step(&mut fx.env());
        assert!(!fx.channels[0o2].state.flag);
        assert_eq!(pp.p, 0o102);
    }

    #[test]
    fn test_channel_flag_opcodes_pass_without_the_register() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.mem[0] = op(0o24, 0o2);
        pp.mem[1] = 0o777; // would be the jump target on flag models
        pp.step(&mut fx.env());
        // One-word pass: no second word consumed, no flag touched.
        assert_eq!(pp.p, 1);
        assert!(!fx.channels[0o2].state.flag);
    }

    #[test]
    fn test_channel_jump_tests() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        fx.channels[0o2].activate();

        pp.mem[0] = op(0o64, 0o2); // AJM 2,200
        pp.mem[1] = 0o200;
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o200);

        // EJM on an empty channel jumps too.
        pp.mem[0o200] = op(0o67, 0o2);
        pp.mem[0o201] = 0o300;
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 0o300);
    }

    #[test]
    fn test_iam_block_input() {
        /// Device that feeds an incrementing word each io call.
        struct Feeder {
            next: PpWord,
        }
        impl Device for Feeder {
            fn kind(&self) -> DeviceKind {
                DeviceKind::Console
            }
            fn func(&mut self, _ch: &mut crate::channel::ChannelState, _c: PpWord) -> FcStatus {
                FcStatus::Accepted
            }
            fn io(&mut self, ch: &mut crate::channel::ChannelState) {
                if !ch.full {
                    ch.data = self.next;
                    ch.full = true;
                    self.next += 1;
                }
            }
        
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

        let mut fx = Fixture::new();
        fx.channels[0o4].attach(Box::new(Feeder { next: 0o100 }), false);
        fx.channels[0o4].activate();

        let mut pp = ppu();
        pp.a = 3; // three words
        pp.mem[0] = op(0o71, 0o4); // IAM 4,500
        pp.mem[1] = 0o500;

        // Alternate PPU and channel steps as the scheduler does.
        for _ in 0..10 {
            pp.step(&mut fx.env());
            for channel in fx.channels.iter_mut() {
                channel.step();
            }
            if pp.p != 0 {
                break;
            }
        }

        assert_eq!(pp.p, 2);
        assert_eq!(pp.mem[0o500], 0o100);
        assert_eq!(pp.mem[0o501], 0o101);
        assert_eq!(pp.mem[0o502], 0o102);
        assert_eq!(pp.a & 0o777777, 0);
    }

    #[test]
    fn test_iam_terminates_on_disconnect() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        fx.channels[0o4].activate();

        pp.a = 5;
        pp.mem[0] = op(0o71, 0o4); // IAM 4,500
        pp.mem[1] = 0o500;
        pp.step(&mut fx.env()); // waits, transfer in flight

        fx.channels[0o4].disconnect();
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 2); // instruction terminated
        assert_eq!(pp.mem[0o500], 0); // zero word planted
        assert_eq!(pp.a, 5); // undelivered count retained
    }

    #[test]
    fn test_exn_posts_exchange_request() {
        let mut fx = Fixture::new();
        let mut pp = ppu();
        pp.a = 0o2000;
        pp.mem[0] = op(0o26, 0); // EXN
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 1);
        assert!(fx.gate.has_request(0));
        assert_eq!(fx.gate.monitor_cpu(), 0);

        // A second EXN while the monitor exists waits.
        pp.mem[1] = op(0o26, 0);
        pp.step(&mut fx.env());
        assert_eq!(pp.p, 1);
    }

    #[test]
    fn test_function_declined_still_completes() {
        struct Decliner;
        impl Device for Decliner {
            fn kind(&self) -> DeviceKind {
                DeviceKind::Console
            }
            fn func(&mut self, _ch: &mut crate::channel::ChannelState, _c: PpWord) -> FcStatus {
                FcStatus::Declined
            }
            fn io(&mut self, _ch: &mut crate::channel::ChannelState) {}
        
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

        let mut fx = Fixture::new();
        fx.channels[0o6].attach(Box::new(Decliner), false);
        let mut pp = ppu();
        pp.mem[0] = op(0o77, 0o6); // FNC 6,xx
        pp.mem[1] = 0o123;
        pp.step(&mut fx.env());
        // The PP completes and can observe the channel staying inactive.
        assert_eq!(pp.p, 2);
        assert!(!fx.channels[0o6].state.active);
    }
}
