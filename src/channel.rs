//! I/O channels
//!
//! A channel is a 12-bit bidirectional path between the PPUs and one
//! device. Channel state is a small machine: `active` is the connection
//! flag, `full` says the data register holds a word one side has not yet
//! consumed. Exactly one party toggles `full` per exchange - the PPU when
//! it outputs or consumes input, the device when it consumes output or
//! produces input.
//!
//! Channels 14-17 are hardwired (clock, interlock/two-port mux, status and
//! control, maintenance) and cannot be reassigned by configuration.
//!
//! The delay counters exist for pairs of cooperating PPUs: a device can set
//! `delay_status` so the channel reports full for a fixed number of cycles,
//! long enough for a second PPU to observe the transfer. Guest operating
//! systems rely on this timing; do not "fix" it.

use log::info;

use crate::device::{Device, DeviceKind, FcStatus};
use crate::words::PpWord;

/// Hardwired channel numbers.
pub const CH_CLOCK: u8 = 0o14;
pub const CH_INTERLOCK: u8 = 0o15;
pub const CH_TWO_PORT_MUX: u8 = 0o15;
pub const CH_STATUS_CONTROL: u8 = 0o16;
pub const CH_MAINTENANCE: u8 = 0o17;

/// Highest possible channel count.
pub const MAX_CHANNELS: usize = 0o40;

/// Mutable channel register state, shared with the attached device during
/// `func`/`io` calls.
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Channel number, 5 bits.
    pub id: u8,
    /// Channel is connected to its device.
    pub active: bool,
    /// Data register holds an unconsumed word.
    pub full: bool,
    /// Data register.
    pub data: PpWord,
    /// Device status lines.
    pub status: PpWord,
    /// Channel flag: the SCF/CCF test-and-set interlock on models with
    /// the flag register.
    pub flag: bool,
    /// Device input will arrive on a later cycle.
    pub input_pending: bool,
    /// Disconnect the channel once pending input has drained.
    pub disc_after_input: bool,
    /// Cycles the channel keeps reporting full for a cooperating PPU.
    pub delay_status: u8,
    /// Cycles until a deferred disconnect fires.
    pub delay_disconnect: u8,
    /// Channel is one of the hardwired 14-17 group.
    pub hardwired: bool,
}

impl ChannelState {
    fn new(id: u8) -> Self {
        Self {
            id,
            active: false,
            full: false,
            data: 0,
            status: 0,
            flag: false,
            input_pending: false,
            disc_after_input: false,
            delay_status: 0,
            delay_disconnect: 0,
            hardwired: false,
        }
    }

    /// Full as observed by FJM/EJM: the delay counter keeps the channel
    /// looking full while it runs down.
    pub fn observed_full(&self) -> bool {
        self.full || self.delay_status > 0
    }
}

/// One channel slot: register state plus the attached device, if any.
///
/// A channel with no device is idle but not an error; PPU opcodes aimed at
/// it simply never see `full` come true.
pub struct Channel {
    pub state: ChannelState,
    pub device: Option<Box<dyn Device>>,
}

impl Channel {
    pub fn new(id: u8) -> Self {
        Self {
            state: ChannelState::new(id),
            device: None,
        }
    }

    /// Attach a device. Hardwired attachments mark the channel so config
    /// cannot re-use it.
    pub fn attach(&mut self, device: Box<dyn Device>, hardwired: bool) {
        self.state.hardwired = hardwired;
        self.device = Some(device);
    }

    /// Kind of the attached device, if any.
    pub fn device_kind(&self) -> Option<DeviceKind> {
        self.device.as_ref().map(|d| d.kind())
    }

    /// Per-cycle channel step, run after all PPUs have stepped.
    pub fn step(&mut self) {
        if self.state.delay_status > 0 {
            self.state.delay_status -= 1;
        }

        if self.state.delay_disconnect > 0 {
            self.state.delay_disconnect -= 1;
            if self.state.delay_disconnect == 0 && self.state.disc_after_input {
                self.state.disc_after_input = false;
                if let Some(device) = &mut self.device {
                    device.disconnect(&mut self.state);
                }
                self.state.active = false;
                return;
            }
        }

        if self.state.active {
            if let Some(device) = &mut self.device {
                device.io(&mut self.state);
            }
        }
    }

    // ========== PPU-side operations ==========

    /// Activate the channel (ACN).
    pub fn activate(&mut self) {
        self.state.active = true;
        if let Some(device) = &mut self.device {
            device.activate(&mut self.state);
        }
    }

    /// Disconnect the channel (DCN).
    pub fn disconnect(&mut self) {
        self.state.active = false;
        self.state.full = false;
        if let Some(device) = &mut self.device {
            device.disconnect(&mut self.state);
        }
    }

    /// Present a function code (FAN/FNC). Hardwired channels accept
    /// without a device round trip when no device consumes functions.
    pub fn function(&mut self, code: PpWord) -> FcStatus {
        match &mut self.device {
            Some(device) => device.func(&mut self.state, code),
            None => FcStatus::Declined,
        }
    }

    /// PPU writes a word to the channel (OAN/OAM). Caller has checked
    /// `!full`.
    pub fn output(&mut self, word: PpWord) {
        self.state.data = word & 0o7777;
        self.state.full = true;
    }

    /// PPU consumes the input word (IAN/IAM). Caller has checked `full`.
    pub fn input(&mut self) -> PpWord {
        self.state.full = false;
        let word = self.state.data;
        if self.state.disc_after_input && !self.state.input_pending {
            self.state.active = false;
            self.state.disc_after_input = false;
        }
        word
    }
}

/// Build the channel bank for a mainframe: `count` configurable channels
/// plus the hardwired group, which always exists.
pub fn init_channels(count: u8) -> Vec<Channel> {
    let total = (count as usize).max(CH_MAINTENANCE as usize + 1);
    let channels = (0..total as u8).map(Channel::new).collect();
    info!("channels initialised (number of channels {:o})", count);
    channels
}
