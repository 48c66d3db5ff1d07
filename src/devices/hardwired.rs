//! Hardwired register channels
//!
//! Channels 15-17 host small register devices on the models that have
//! them: the interlock register (or two-port mux) on 15, the status and
//! control register on 16, and the maintenance channel on 17. None of
//! these can be reassigned by configuration.

use crate::channel::ChannelState;
use crate::device::{Device, DeviceKind, FcStatus};
use crate::words::PpWord;

// Interlock register functions: the low octal digit carries the bit
// number for the bit operations.
pub const FC_ILR_SET_BIT: PpWord = 0o0100;
pub const FC_ILR_CLEAR_BIT: PpWord = 0o0200;
pub const FC_ILR_TEST_BIT: PpWord = 0o0300;
pub const FC_ILR_CLEAR_ALL: PpWord = 0o0400;
pub const FC_ILR_READ: PpWord = 0o0500;

/// Interlock register: 64 bits the PPUs of one mainframe use to
/// coordinate with each other.
pub struct InterlockRegister {
    bits: u64,
    /// Words left to deliver for a read function, low 12 bits first.
    read_remaining: usize,
    test_result: Option<PpWord>,
}

impl InterlockRegister {
    pub fn new() -> Self {
        Self {
            bits: 0,
            read_remaining: 0,
            test_result: None,
        }
    }
}

impl Default for InterlockRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for InterlockRegister {
    fn kind(&self) -> DeviceKind {
        DeviceKind::InterlockRegister
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        let bit = (code & 0o77) as u64;
        match code & 0o7700 {
            FC_ILR_SET_BIT => {
                self.bits |= 1 << bit;
                FcStatus::Processed
            }
            FC_ILR_CLEAR_BIT => {
                self.bits &= !(1 << bit);
                FcStatus::Processed
            }
            FC_ILR_TEST_BIT => {
                self.test_result = Some(((self.bits >> bit) & 1) as PpWord);
                FcStatus::Accepted
            }
            FC_ILR_CLEAR_ALL => {
                self.bits = 0;
                FcStatus::Processed
            }
            FC_ILR_READ => {
                self.read_remaining = 6; // 64 bits in 12-bit pieces
                FcStatus::Accepted
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        if ch.full {
            return;
        }
        if let Some(result) = self.test_result.take() {
            ch.data = result;
            ch.full = true;
        } else if self.read_remaining > 0 {
            let shift = (6 - self.read_remaining) * 12;
            ch.data = ((self.bits >> shift) & 0o7777) as PpWord;
            ch.full = true;
            self.read_remaining -= 1;
        }
    }

    fn disconnect(&mut self, _ch: &mut ChannelState) {
        self.read_remaining = 0;
        self.test_result = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Status and control register: a bank of bits the OS reads and writes
/// through channel 16. Writes arrive as (bit number, value) words;
/// reads deliver the addressed 12-bit group.
pub struct StatusControlRegister {
    bits: Vec<bool>,
    read_group: Option<usize>,
}

// Register length on the 170-series models.
const SCR_BITS: usize = 0o1000;

pub const FC_SCR_READ_GROUP: PpWord = 0o1000;
pub const FC_SCR_SET_BIT: PpWord = 0o2000;
pub const FC_SCR_CLEAR_ALL: PpWord = 0o3000;

impl StatusControlRegister {
    pub fn new() -> Self {
        Self {
            bits: vec![false; SCR_BITS],
            read_group: None,
        }
    }
}

impl Default for StatusControlRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for StatusControlRegister {
    fn kind(&self) -> DeviceKind {
        DeviceKind::StatusControlRegister
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        let operand = (code & 0o777) as usize;
        match code & 0o7000 {
            FC_SCR_READ_GROUP => {
                self.read_group = Some(operand);
                FcStatus::Accepted
            }
            FC_SCR_SET_BIT => {
                if operand < SCR_BITS {
                    self.bits[operand] = true;
                }
                FcStatus::Processed
            }
            FC_SCR_CLEAR_ALL => {
                self.bits.fill(false);
                FcStatus::Processed
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        if ch.full {
            return;
        }
        if let Some(group) = self.read_group.take() {
            let base = group * 12;
            let mut word = 0 as PpWord;
            for offset in 0..12 {
                if *self.bits.get(base + offset).unwrap_or(&false) {
                    word |= 1 << offset;
                }
            }
            ch.data = word;
            ch.full = true;
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Maintenance channel: accepts everything, answers zeros. Present so
/// 800-series deadstart sequences that probe channel 17 find something
/// on the wire.
pub struct MaintenanceChannel;

impl Device for MaintenanceChannel {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MaintenanceChannel
    }

    fn func(&mut self, _ch: &mut ChannelState, _code: PpWord) -> FcStatus {
        FcStatus::Accepted
    }

    fn io(&mut self, ch: &mut ChannelState) {
        if !ch.full {
            ch.data = 0;
            ch.full = true;
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
