//! Real-time clock
//!
//! The RTC is a 32-bit counter paced one of two ways:
//! - a fixed increment added on every major cycle (`clock=` in the profile)
//! - host time: increment 0 selects the host's monotonic microsecond clock,
//!   with fractional carry and a 400 microsecond per-read clamp so a
//!   stalled emulator does not leap forward
//!
//! PPUs read the low 12 bits through hardwired channel 14, which is input
//! only and always full. The RTC also owns `cycles`, the 64-bit major-cycle
//! counter used for device latency accounting.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::channel::ChannelState;
use crate::config::Features;
use crate::device::{Device, DeviceKind, FcStatus};
use crate::words::{PpWord, MASK12};

/// Largest number of microseconds folded into the clock per read.
const MAX_MICROSECONDS: f64 = 400.0;

struct Pace {
    origin: Instant,
    /// Microseconds already folded into the clock.
    consumed: u64,
    /// Sub-microsecond remainder carried between reads.
    fraction: f64,
    /// Clamped overrun carried to later reads.
    delayed: f64,
}

/// The clock shared between the scheduler thread and the channel-14 device.
pub struct Rtc {
    increment: u32,
    clock: AtomicU32,
    cycles: AtomicU64,
    pace: Mutex<Pace>,
}

impl Rtc {
    /// Build a clock. `increment` of zero selects host-microsecond pacing.
    pub fn new(increment: u32) -> Arc<Rtc> {
        Arc::new(Rtc {
            increment,
            clock: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
            pace: Mutex::new(Pace {
                origin: Instant::now(),
                consumed: 0,
                fraction: 0.0,
                delayed: 0.0,
            }),
        })
    }

    /// Advance one major cycle.
    pub fn tick(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if self.increment != 0 {
            self.clock.fetch_add(self.increment, Ordering::Relaxed);
        }
    }

    /// Major cycles since startup.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Current 32-bit clock value.
    pub fn clock(&self) -> u32 {
        if self.increment == 0 {
            self.fold_host_time();
        }
        self.clock.load(Ordering::Relaxed)
    }

    /// Low 12 bits, as delivered on channel 14.
    pub fn low12(&self) -> PpWord {
        (self.clock() as u64 & MASK12) as PpWord
    }

    /// Fold elapsed host microseconds into the clock, clamped per read.
    fn fold_host_time(&self) {
        let mut pace = self.pace.lock().expect("rtc pace lock");

        let elapsed = pace.origin.elapsed().as_micros() as u64;
        if elapsed < pace.consumed {
            return;
        }
        let difference = (elapsed - pace.consumed) as f64;
        pace.consumed = elapsed;

        let mut microseconds = difference + pace.fraction + pace.delayed;
        pace.delayed = 0.0;
        if microseconds > MAX_MICROSECONDS {
            pace.delayed = microseconds - MAX_MICROSECONDS;
            microseconds = MAX_MICROSECONDS;
        }

        let whole = microseconds.floor();
        pace.fraction = microseconds - whole;
        self.clock.fetch_add(whole as u32, Ordering::Relaxed);
    }
}

/// The hardwired clock channel device.
///
/// Input only; the channel is always full, holding the low 12 bits of the
/// clock. On models with the full RTC the channel is also permanently
/// active.
pub struct RtcDevice {
    rtc: Arc<Rtc>,
    always_full: bool,
}

impl RtcDevice {
    pub fn new(rtc: Arc<Rtc>, features: Features) -> Self {
        Self {
            rtc,
            always_full: features.contains(Features::FULL_RTC),
        }
    }

    /// Channel 14 comes up active and full on full-RTC models.
    pub fn prime_channel(&self, ch: &mut ChannelState) {
        ch.hardwired = true;
        ch.full = self.always_full;
        ch.active = self.always_full;
        ch.data = self.rtc.low12();
    }
}

impl Device for RtcDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Rtc
    }

    fn func(&mut self, _ch: &mut ChannelState, _code: PpWord) -> FcStatus {
        FcStatus::Accepted
    }

    fn io(&mut self, ch: &mut ChannelState) {
        ch.data = self.rtc.low12();
        ch.full = true;
    }

    fn disconnect(&mut self, ch: &mut ChannelState) {
        // The clock cannot be disconnected; it reverts to full at once.
        ch.full = self.always_full;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
