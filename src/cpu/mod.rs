//! Central processor
//!
//! A 60-bit word-oriented CPU with eight each of the A (address), B (index)
//! and X (operand) registers. Instructions come in 15-bit and 30-bit
//! parcels, four parcels to a word; `step` executes one instruction word.
//!
//! # Module organization
//!
//! - `execute`: instruction execution, one function per decode family
//! - `helpers`: ones-complement shift, normalize and floating-point units
//! - `tests`: CPU test suite
//!
//! # Exchange jump
//!
//! The exchange jump swaps the full CPU context with a 16-word package in
//! central memory. It is the only cross-thread operation the CPU performs:
//! all requests (the XJ opcode, the PPU monitor request, deadstart) are
//! arbitrated by the [`ExchangeGate`], which also tracks which CPU is the
//! monitor. The gate is a rendezvous, not a shared-register race: each CPU
//! applies exchanges to its own context at instruction boundaries only.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::config::Features;
use crate::memory::CentralMemory;
use crate::extended::ExtendedMemory;
use crate::words::{CpWord, MASK12, MASK18, MASK24, MASK60};

mod execute;
pub mod helpers;

#[cfg(test)]
mod tests;

// ========== Exit conditions ==========

/// Address out of range (reference beyond FL).
pub const EC_ADDRESS: u32 = 0o010000;
/// Operand out of range (unnormalised floating operand).
pub const EC_OPERAND: u32 = 0o020000;
/// Indefinite operand (0/0, infinity minus infinity, ...).
pub const EC_INDEFINITE: u32 = 0o040000;

// ========== Exchange gate ==========

/// Where an exchange request came from. Carried for trace output only;
/// the swap itself is identical for all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XjSource {
    /// The XJ opcode.
    CentralXj,
    /// A PPU monitor request (EXN).
    PpuMonitorRequest,
    /// Initial deadstart load.
    Deadstart,
}

/// A pending exchange posted to a CPU.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeRequest {
    /// Absolute central-memory address of the 16-word package.
    pub addr: u32,
    pub source: XjSource,
}

struct GateState {
    /// Which CPU is the monitor; -1 when none. At most one at a time.
    monitor_cpu: i8,
    /// Posted exchange, one slot per CPU.
    requests: [Option<ExchangeRequest>; 2],
}

/// Per-mainframe exchange-jump arbiter.
///
/// Serialises monitor transitions and package swaps between the two CPUs
/// and carries exchange requests from the PPUs (which run on the scheduler
/// thread) to whichever thread owns the target CPU.
pub struct ExchangeGate {
    state: Mutex<GateState>,
    /// Lock-free fast path: does CPU n have a request posted?
    pending: [AtomicBool; 2],
    /// P-register mirrors so PPUs can execute RPN without touching the
    /// CPU context.
    cpu_p: [AtomicU32; 2],
}

impl ExchangeGate {
    pub fn new() -> Arc<ExchangeGate> {
        Arc::new(ExchangeGate {
            state: Mutex::new(GateState {
                monitor_cpu: -1,
                requests: [None, None],
            }),
            pending: [AtomicBool::new(false), AtomicBool::new(false)],
            cpu_p: [AtomicU32::new(0), AtomicU32::new(0)],
        })
    }

    /// Post a monitor exchange request to `cpu`. Fails (returns false) if a
    /// monitor already exists or a request is still pending; the caller
    /// re-issues on a later cycle.
    pub fn request_monitor_exchange(&self, cpu: usize, addr: u32, source: XjSource) -> bool {
        let mut state = self.state.lock().expect("exchange gate lock");
        if state.monitor_cpu >= 0 || state.requests[cpu].is_some() {
            return false;
        }
        state.monitor_cpu = cpu as i8;
        state.requests[cpu] = Some(ExchangeRequest { addr, source });
        self.pending[cpu].store(true, Ordering::Release);
        true
    }

    /// Cheap check whether a request is posted for `cpu`.
    pub fn has_request(&self, cpu: usize) -> bool {
        self.pending[cpu].load(Ordering::Acquire)
    }

    /// Take the posted request for `cpu`, if any.
    fn take_request(&self, cpu: usize) -> Option<ExchangeRequest> {
        let mut state = self.state.lock().expect("exchange gate lock");
        let request = state.requests[cpu].take();
        if request.is_some() {
            self.pending[cpu].store(false, Ordering::Release);
        }
        request
    }

    /// Current monitor CPU, -1 when none.
    pub fn monitor_cpu(&self) -> i8 {
        self.state.lock().expect("exchange gate lock").monitor_cpu
    }

    /// Last published P of `cpu` (for the PPU RPN opcode).
    pub fn cpu_p(&self, cpu: usize) -> u32 {
        self.cpu_p[cpu].load(Ordering::Relaxed)
    }
}

/// Instruction-word stack depth on the models that have one.
const IW_STACK_SIZE: usize = 12;

/// Outcome of the XJ monitor arbitration.
enum XjRole {
    /// This CPU was the monitor; it exits to the package at the operand
    /// address.
    ExitMonitor,
    /// No monitor existed; this CPU becomes it and exchanges at MA.
    EnterMonitor,
    /// Another CPU is the monitor; the instruction stalls.
    Busy,
}

// ========== CPU context ==========

/// One central processor.
pub struct Cpu {
    /// CPU number on its mainframe, 0 or 1.
    pub id: usize,
    /// Program counter, 18 bits, word address relative to RA.
    pub p: u32,
    /// Address registers A0-A7, 18 bits.
    pub a: [u32; 8],
    /// Index registers B0-B7, 18 bits. B0 reads as zero always.
    pub b: [u32; 8],
    /// Operand registers X0-X7, 60 bits.
    pub x: [CpWord; 8],
    /// Reference address for central memory.
    pub ra: u32,
    /// Field length for central memory.
    pub fl: u32,
    /// Reference address for extended memory.
    pub ra_ecs: u32,
    /// Field length for extended memory.
    pub fl_ecs: u32,
    /// Exit mode: which exit conditions stop the CPU.
    pub exit_mode: u32,
    /// Accumulated exit conditions.
    pub exit_condition: u32,
    /// Monitor address: exchange package address for user-mode XJ.
    pub ma: u32,
    /// CPU is stopped awaiting an exchange.
    pub stopped: bool,

    /// Current instruction word.
    iw: CpWord,
    /// Next parcel within `iw`, 0..4. 0 means fetch a new word.
    parcel: u8,
    /// An instruction stalled (XJ arbitration); end the word so it
    /// re-executes next step.
    stalled: bool,

    // Instruction stack, on models with the feature. The stack is not
    // coherent with stores, matching the hardware.
    iw_stack: [CpWord; IW_STACK_SIZE],
    iw_stack_addr: [u32; IW_STACK_SIZE],
    iw_stack_valid: [bool; IW_STACK_SIZE],
    iw_stack_next: usize,

    features: Features,
    cm: Arc<CentralMemory>,
    ecs: Arc<ExtendedMemory>,
    gate: Arc<ExchangeGate>,
}

impl Cpu {
    /// Create a CPU in the deadstart state: everything zero, stopped,
    /// waiting for the first exchange.
    pub fn new(
        id: usize,
        features: Features,
        cm: Arc<CentralMemory>,
        ecs: Arc<ExtendedMemory>,
        gate: Arc<ExchangeGate>,
    ) -> Self {
        Self {
            id,
            p: 0,
            a: [0; 8],
            b: [0; 8],
            x: [0; 8],
            ra: 0,
            fl: 0,
            ra_ecs: 0,
            fl_ecs: 0,
            exit_mode: 0,
            exit_condition: 0,
            ma: 0,
            stopped: true,
            iw: 0,
            parcel: 0,
            stalled: false,
            iw_stack: [0; IW_STACK_SIZE],
            iw_stack_addr: [0; IW_STACK_SIZE],
            iw_stack_valid: [false; IW_STACK_SIZE],
            iw_stack_next: 0,
            features,
            cm,
            ecs,
            gate,
        }
    }

    /// Reset to the deadstart state.
    pub fn reset(&mut self) {
        self.p = 0;
        self.a = [0; 8];
        self.b = [0; 8];
        self.x = [0; 8];
        self.ra = 0;
        self.fl = 0;
        self.ra_ecs = 0;
        self.fl_ecs = 0;
        self.exit_mode = 0;
        self.exit_condition = 0;
        self.ma = 0;
        self.stopped = true;
        self.iw = 0;
        self.parcel = 0;
        self.stalled = false;
        self.void_stack();
        self.iw_stack_next = 0;
    }

    /// Execute one instruction word. Returns true if the CPU is (now)
    /// stopped, letting the scheduler cut the ratio loop short.
    pub fn step(&mut self) -> bool {
        // Apply any exchange posted by a PPU or the other thread first;
        // an exchange restarts a stopped CPU.
        if self.gate.has_request(self.id) {
            let gate = Arc::clone(&self.gate);
            if let Some(request) = gate.take_request(self.id) {
                self.exchange_jump(request.addr, request.source);
            }
        }

        if self.stopped {
            return true;
        }

        // Execute parcels until the word is consumed. Branches, faults
        // and stalls cut the word short.
        self.stalled = false;
        loop {
            if !self.execute_instruction() {
                break;
            }
            // B0 is hardwired to zero; undo any write an instruction made.
            self.b[0] = 0;
            if self.parcel == 0 || self.stopped || self.stalled {
                break;
            }
        }
        self.b[0] = 0;

        self.gate.cpu_p[self.id].store(self.p, Ordering::Relaxed);
        self.stopped
    }

    // ========== Parcel stream ==========

    /// Fetch the next 15-bit parcel, loading a new instruction word when
    /// the current one is exhausted. Returns None on an address fault.
    fn fetch_parcel(&mut self) -> Option<u16> {
        if self.parcel == 0 {
            self.iw = self.fetch_instruction_word(self.p)?;
        }
        let shift = 45 - 15 * self.parcel as u32;
        let parcel = ((self.iw >> shift) & 0o77777) as u16;
        self.parcel += 1;
        if self.parcel == 4 {
            self.parcel = 0;
            self.p = (self.p + 1) & MASK18 as u32;
        }
        Some(parcel)
    }

    /// Instruction-word fetch, through the instruction stack on models
    /// that have one. A stack hit does not touch central memory; a miss
    /// reads, stacks the word, and prefetches the next one on models
    /// with stack prefetch.
    fn fetch_instruction_word(&mut self, p: u32) -> Option<CpWord> {
        if !self.features.contains(Features::INSTRUCTION_STACK) {
            return self.cm_read(p);
        }
        if let Some(word) = self.stack_lookup(p) {
            return Some(word);
        }
        let word = self.cm_read(p)?;
        self.stack_push(p, word);
        if self.features.contains(Features::ISTACK_PREFETCH) {
            self.prefetch_word(p.wrapping_add(1) & MASK18 as u32);
        }
        Some(word)
    }

    fn stack_lookup(&self, p: u32) -> Option<CpWord> {
        for rank in 0..IW_STACK_SIZE {
            if self.iw_stack_valid[rank] && self.iw_stack_addr[rank] == p {
                return Some(self.iw_stack[rank]);
            }
        }
        None
    }

    fn stack_push(&mut self, p: u32, word: CpWord) {
        let rank = self.iw_stack_next;
        self.iw_stack[rank] = word;
        self.iw_stack_addr[rank] = p;
        self.iw_stack_valid[rank] = true;
        self.iw_stack_next = (rank + 1) % IW_STACK_SIZE;
    }

    /// Prefetch never raises an exit condition; an out-of-field word is
    /// simply not stacked.
    fn prefetch_word(&mut self, p: u32) {
        if p >= self.fl || self.stack_lookup(p).is_some() {
            return;
        }
        let word = self.cm.read(self.ra.wrapping_add(p));
        self.stack_push(p, word);
    }

    /// Invalidate the instruction stack. Exchange jumps and branches out
    /// of the stack flush it.
    fn void_stack(&mut self) {
        self.iw_stack_valid = [false; IW_STACK_SIZE];
    }

    /// Redirect the parcel stream to a new word address. A jump to a word
    /// still in the instruction stack keeps the stack (a loop executes
    /// without memory fetches); any other target voids it.
    fn branch_to(&mut self, addr: u32) {
        self.p = addr & MASK18 as u32;
        self.parcel = 0;
        if self.features.contains(Features::INSTRUCTION_STACK)
            && self.stack_lookup(self.p).is_none()
        {
            self.void_stack();
        }
    }

    /// Address of the next instruction word (used by RJ).
    fn next_word_address(&self) -> u32 {
        if self.parcel == 0 {
            self.p
        } else {
            (self.p + 1) & MASK18 as u32
        }
    }

    // ========== Central memory, RA/FL mapped ==========

    /// Resolve a relative address within the field. An address at or
    /// beyond FL always raises the address exit condition; on models
    /// without NoCmWrap the access then wraps modulo FL and completes,
    /// while NoCmWrap models abandon it.
    fn cm_index(&mut self, rel: u32) -> Option<u32> {
        if rel < self.fl {
            return Some(self.ra.wrapping_add(rel));
        }
        self.raise(EC_ADDRESS);
        if self.stopped || self.fl == 0 || self.features.contains(Features::NO_CM_WRAP) {
            return None;
        }
        Some(self.ra.wrapping_add(rel % self.fl))
    }

    /// Read a word at `rel` within the field. None when the access was
    /// abandoned on an address fault.
    pub(crate) fn cm_read(&mut self, rel: u32) -> Option<CpWord> {
        let addr = self.cm_index(rel)?;
        Some(self.cm.read(addr))
    }

    /// Write a word at `rel` within the field.
    pub(crate) fn cm_write(&mut self, rel: u32, word: CpWord) -> Option<()> {
        let addr = self.cm_index(rel)?;
        self.cm.write(addr, word);
        Some(())
    }

    /// Record an exit condition; stop if the exit mode selects it.
    pub(crate) fn raise(&mut self, condition: u32) {
        self.exit_condition |= condition;
        if self.exit_mode & condition != 0 {
            debug!(
                "cpu{}: error exit, condition {:o} at P={:o}",
                self.id, condition, self.p
            );
            self.stopped = true;
        }
    }

    // ========== Instruction execution ==========

    /// Decode and execute one instruction. Returns false when the word is
    /// abandoned (fault or stop mid-word).
    fn execute_instruction(&mut self) -> bool {
        let parcel = match self.fetch_parcel() {
            Some(parcel) => parcel,
            None => return false,
        };

        let fm = (parcel >> 9) as u8; // 6-bit opcode
        let i = ((parcel >> 6) & 7) as usize;
        let j = ((parcel >> 3) & 7) as usize;
        let k = (parcel & 7) as usize;

        // 30-bit instructions continue with an 18-bit K whose top three
        // bits sit in the k position.
        let long = matches!(fm, 0o01..=0o07 | 0o50..=0o52 | 0o60..=0o62 | 0o70..=0o72);
        let kfield = if long {
            let low = match self.fetch_parcel() {
                Some(parcel) => parcel,
                None => return false,
            };
            ((k as u32) << 15) | low as u32
        } else {
            0
        };

        trace!(
            "cpu{}: P={:o} fm={:o} i={} j={} k={} K={:o}",
            self.id,
            self.p,
            fm,
            i,
            j,
            k,
            kfield
        );

        match fm {
            0o00 => self.op_program_stop(),
            0o01 => self.op_01(i, j, kfield),
            0o02 => self.op_jump(i, kfield),
            0o03 => self.op_branch_x(i, j, kfield),
            0o04..=0o07 => self.op_branch_b(fm, i, j, kfield),
            0o10..=0o17 => self.op_logical(fm, i, j, k),
            0o20..=0o27 => self.op_shift(fm, i, j, k),
            0o30..=0o37 => self.op_float_add(fm, i, j, k),
            0o40..=0o47 => self.op_multiply_divide(fm, i, j, k),
            0o50..=0o57 => self.op_set_a(fm, i, j, k, kfield),
            0o60..=0o67 => self.op_set_b(fm, i, j, k, kfield),
            0o70..=0o77 => self.op_set_x(fm, i, j, k, kfield),
            _ => unreachable!("fm is 6 bits"),
        }

        !self.stopped
    }

    // ========== Exchange jump ==========

    /// Atomically swap this CPU's context with the 16-word package at the
    /// absolute address `addr`. B0 is forced to zero afterwards, and a
    /// stopped CPU restarts.
    pub fn exchange_jump(&mut self, addr: u32, source: XjSource) {
        // Read the incoming package before overwriting it with the
        // outgoing context.
        let mut package = [0u64; 16];
        for (offset, word) in package.iter_mut().enumerate() {
            *word = self.cm.read(addr + offset as u32);
        }

        for offset in 0..8 {
            let upper = match offset {
                0 => (self.p as u64 & MASK18) << 36,
                1 => ((self.ra as u64 >> 6) & MASK18) << 36,
                2 => ((self.fl as u64 >> 6) & MASK18) << 36,
                3 => ((self.exit_mode | self.exit_condition) as u64 & MASK18) << 36,
                4 => ((self.ra_ecs as u64 >> 6) & MASK24) << 36,
                5 => ((self.fl_ecs as u64 >> 6) & MASK24) << 36,
                6 => (self.ma as u64 & MASK18) << 36,
                _ => 0,
            };
            let word = upper
                | ((self.a[offset] as u64 & MASK18) << 18)
                | (self.b[offset] as u64 & MASK18);
            self.cm.write(addr + offset as u32, word);
        }
        for offset in 0..8 {
            self.cm.write(addr + 8 + offset as u32, self.x[offset]);
        }

        // Load the incoming context.
        self.p = ((package[0] >> 36) & MASK18) as u32;
        self.ra = (((package[1] >> 36) & MASK18) as u32) << 6;
        self.fl = (((package[2] >> 36) & MASK18) as u32) << 6;
        let em = ((package[3] >> 36) & MASK18) as u32;
        self.exit_mode = em & (EC_ADDRESS | EC_OPERAND | EC_INDEFINITE);
        self.exit_condition = 0;
        self.ra_ecs = (((package[4] >> 36) & MASK24) as u32) << 6;
        self.fl_ecs = (((package[5] >> 36) & MASK24) as u32) << 6;
        self.ma = ((package[6] >> 36) & MASK18) as u32;
        for offset in 0..8 {
            self.a[offset] = ((package[offset] >> 18) & MASK18) as u32;
            self.b[offset] = (package[offset] & MASK18) as u32;
            self.x[offset] = package[8 + offset] & MASK60;
        }
        self.b[0] = 0;

        self.parcel = 0;
        self.void_stack();
        self.stopped = false;

        trace!(
            "cpu{}: exchange at {:o} ({:?}) -> P={:o} RA={:o} FL={:o}",
            self.id,
            addr,
            source,
            self.p,
            self.ra,
            self.fl
        );
        self.gate.cpu_p[self.id].store(self.p, Ordering::Relaxed);
    }

    /// XJ opcode: monitor exchange under the gate lock.
    fn op_exchange_jump(&mut self, j: usize, kfield: u32) {
        if self.features.contains(Features::NO_CEJ_MEJ) {
            // Without CEJ/MEJ the opcode acts as a program stop.
            self.op_program_stop();
            return;
        }

        let gate = Arc::clone(&self.gate);
        let mut state = gate.state.lock().expect("exchange gate lock");
        let role = if state.monitor_cpu == self.id as i8 {
            state.monitor_cpu = -1;
            XjRole::ExitMonitor
        } else if state.monitor_cpu < 0 {
            state.monitor_cpu = self.id as i8;
            XjRole::EnterMonitor
        } else {
            XjRole::Busy
        };

        match role {
            XjRole::ExitMonitor => {
                // The package records the next instruction word, so the
                // exchanged-out context resumes past the XJ.
                self.p = self.next_word_address();
                self.parcel = 0;
                let addr = crate::words::add18(self.b[j], kfield);
                self.exchange_jump(addr, XjSource::CentralXj);
            }
            XjRole::EnterMonitor => {
                self.p = self.next_word_address();
                self.parcel = 0;
                let addr = self.ma;
                self.exchange_jump(addr, XjSource::CentralXj);
            }
            XjRole::Busy => {
                // Another CPU is the monitor: stall the instruction by
                // rewinding the parcel stream to re-execute it next step.
                drop(state);
                self.rewind_long_instruction();
                self.stalled = true;
            }
        }
    }

    /// Back the parcel stream up over a 30-bit instruction so it
    /// re-executes on the next step.
    fn rewind_long_instruction(&mut self) {
        // Two parcels were consumed. parcel indexes the next parcel; walk
        // back two, borrowing from P when crossing a word boundary.
        let mut borrowed = false;
        for _ in 0..2 {
            if self.parcel == 0 {
                self.p = self.p.wrapping_sub(1) & MASK18 as u32;
                self.parcel = 3;
                borrowed = true;
            } else {
                self.parcel -= 1;
            }
        }
        // If we crossed a word boundary the buffered word is stale.
        // fetch_parcel reloads at parcel 0 by itself.
        if borrowed && self.parcel != 0 {
            if let Some(word) = self.cm_read(self.p) {
                self.iw = word;
            }
        }
    }

    /// Stop the CPU (PS, or XJ without CEJ/MEJ).
    fn op_program_stop(&mut self) {
        debug!("cpu{}: program stop at P={:o}", self.id, self.p);
        self.stopped = true;
    }

    /// 01x family: RJ, ECS block transfers, XJ.
    fn op_01(&mut self, i: usize, j: usize, kfield: u32) {
        match i {
            0 => {
                // RJ K: plant a return jump at K, continue at K+1.
                let ret = self.next_word_address();
                let word = ((0o0400u64 << 18 | ret as u64 & MASK18) << 30) & MASK60;
                if self.cm_write(kfield, word).is_some() {
                    self.branch_to(kfield + 1);
                }
            }
            1 => self.op_ecs_transfer(j, kfield, false),
            2 => self.op_ecs_transfer(j, kfield, true),
            3 => self.op_exchange_jump(j, kfield),
            _ => {
                // Remaining 01x codes are unimplemented on these models;
                // treat as pass.
            }
        }
    }

    /// RE/WE Bj+K: block transfer between central and extended memory.
    /// A0 holds the central address, X0 the extended address.
    fn op_ecs_transfer(&mut self, j: usize, kfield: u32, write: bool) {
        let count = crate::words::add18(self.b[j], kfield);
        if crate::words::is_neg18(count) {
            self.raise(EC_ADDRESS);
            return;
        }
        let count = count as usize;
        if self.ecs.size() == 0 {
            self.raise(EC_ADDRESS);
            return;
        }

        let cm_rel = self.a[0];
        let ecs_rel = (self.x[0] & MASK24) as u32;
        if cm_rel as usize + count > self.fl as usize
            || ecs_rel as usize + count > self.fl_ecs as usize
        {
            self.raise(EC_ADDRESS);
            return;
        }

        let ecs_addr = self.ra_ecs + ecs_rel;
        let mut block = vec![0u64; count];
        if write {
            for (offset, word) in block.iter_mut().enumerate() {
                *word = self.cm.read(self.ra + cm_rel + offset as u32);
            }
            if self.ecs.write_block(ecs_addr, &block).is_err() {
                self.raise(EC_ADDRESS);
            }
        } else {
            if self.ecs.read_block(ecs_addr, &mut block).is_err() {
                self.raise(EC_ADDRESS);
                return;
            }
            for (offset, word) in block.iter().enumerate() {
                self.cm.write(self.ra + cm_rel + offset as u32, *word);
            }
        }
    }

    /// Low 18 bits of an X register, for increment-unit operands.
    pub(crate) fn x18(&self, j: usize) -> u32 {
        (self.x[j] & MASK18) as u32
    }

    /// Low 12 bits of an X register.
    #[allow(dead_code)]
    pub(crate) fn x12(&self, j: usize) -> u32 {
        (self.x[j] & MASK12) as u32
    }
}
