//! Device framework
//!
//! A device is whatever sits on the far end of a channel: a tape drive, a
//! card reader, the console, the NPU. The channel never knows which; it
//! talks to the capability set below.
//!
//! Function codes are 12-bit values sent by a PPU (FAN/FNC). The device
//! answers `Accepted` to latch the code for subsequent data transfers,
//! `Processed` when the code is consumed on the spot, or `Declined` for
//! codes it does not understand - a declined function stays pending in the
//! requesting PPU, which observes channel inactivity and retries.
//!
//! Devices must never block a channel step for longer than one host system
//! call and must tolerate `io` being called when the channel is not full.

use crate::channel::ChannelState;
use crate::words::PpWord;

/// Maximum units behind one controller.
pub const MAX_UNITS: usize = 8;

/// Outcome of a function code presented to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcStatus {
    /// Code latched; subsequent IAN/OAN/IAM/OAM traffic belongs to it.
    Accepted,
    /// Code fully handled; nothing latched.
    Processed,
    /// Code not recognised; the PPU keeps the function pending.
    Declined,
}

/// Device models the core knows how to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Deadstart panel pseudo-device.
    DeadstartPanel,
    /// 669-class magnetic tape drive.
    Mt669,
    /// 405 card reader.
    Cr405,
    /// 501 line printer.
    Lp501,
    /// 512 line printer.
    Lp512,
    /// Console display/keyboard stream.
    Console,
    /// Real-time clock (hardwired, channel 14).
    Rtc,
    /// Interlock register (hardwired, channel 15).
    InterlockRegister,
    /// Status and control register (hardwired, channel 16).
    StatusControlRegister,
    /// Maintenance channel (hardwired, channel 17).
    MaintenanceChannel,
    /// Network processing unit host interface.
    Npu,
}

impl DeviceKind {
    /// Map an equipment-section mnemonic to a device kind. Hardwired
    /// pseudo-devices are not configurable and have no mnemonic.
    pub fn from_mnemonic(name: &str) -> Option<DeviceKind> {
        match name {
            "CO6612" => Some(DeviceKind::Console),
            "MT669" => Some(DeviceKind::Mt669),
            "CR405" => Some(DeviceKind::Cr405),
            "LP501" => Some(DeviceKind::Lp501),
            "LP512" => Some(DeviceKind::Lp512),
            "NPU" => Some(DeviceKind::Npu),
            _ => None,
        }
    }
}

/// The capability set every device exposes to its channel.
pub trait Device: Send {
    /// Which model this is; used for attach-time validation and traces.
    fn kind(&self) -> DeviceKind;

    /// React to a function code.
    fn func(&mut self, ch: &mut ChannelState, code: PpWord) -> FcStatus;

    /// Perform one word of I/O if the channel is ready. Called on every
    /// channel step while the channel is active.
    fn io(&mut self, ch: &mut ChannelState);

    /// Channel activation hook.
    fn activate(&mut self, _ch: &mut ChannelState) {}

    /// Channel disconnect hook.
    fn disconnect(&mut self, _ch: &mut ChannelState) {}

    /// Concrete-type access for operator requests (tape load/unload,
    /// paper removal) that have no channel-level expression.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}
