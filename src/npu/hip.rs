//! NPU host interface
//!
//! The channel-facing side of the NPU. The host PPU announces what it
//! wants with a function code, then moves block bytes over the channel a
//! word at a time (low 8 bits):
//!
//! - status: one word, reporting whether an upline block is waiting
//! - downline orders: service message, low- or high-priority data; the
//!   bytes that follow build a block that is dispatched to SVM or TIP
//!   when the PPU disconnects the channel
//! - upline read: streams the pending upline block; the NPU disconnects
//!   the channel at the end of the block
//! - regulation order: carries the host regulation level in the low bits
//!
//! The NPU proper is shared with the scheduler (which drives the network
//! poll every cycle) behind one mutex; contention is nil because both
//! callers run on the scheduler thread.

use std::sync::{Arc, Mutex};

use crate::channel::ChannelState;
use crate::device::{Device, DeviceKind, FcStatus};
use crate::npu::bip::BipState;
use crate::npu::Npu;
use crate::words::PpWord;

// Function codes.
pub const FC_NPU_STATUS: PpWord = 0o0100;
pub const FC_NPU_READ: PpWord = 0o0200;
pub const FC_NPU_WRITE_SVM: PpWord = 0o0300;
pub const FC_NPU_WRITE_DATA_LOW: PpWord = 0o0301;
pub const FC_NPU_WRITE_DATA_HIGH: PpWord = 0o0302;
/// Regulation order; the low four bits carry the level.
pub const FC_NPU_REGULATION: PpWord = 0o0400;

// Status word bits.
pub const ST_NPU_UPLINE_AVAILABLE: PpWord = 0o0001;
pub const ST_NPU_BUFFERS_LOW: PpWord = 0o0002;

/// Buffer-pool low-water mark reported in the status word.
const BUFFERS_LOW: usize = 32;

/// The host channel device, sharing the NPU with the scheduler.
pub struct NpuHip {
    npu: Arc<Mutex<Npu>>,
    fcode: PpWord,
    status_sent: bool,
}

impl NpuHip {
    pub fn new(npu: Arc<Mutex<Npu>>) -> NpuHip {
        NpuHip {
            npu,
            fcode: 0,
            status_sent: false,
        }
    }
}

impl Device for NpuHip {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Npu
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        let mut npu = self.npu.lock().expect("npu lock");

        if code & 0o7400 == FC_NPU_REGULATION {
            npu.svm_notify_host_regulation((code & 0o17) as u8);
            return FcStatus::Processed;
        }

        match code {
            FC_NPU_STATUS => {
                self.fcode = code;
                self.status_sent = false;
                FcStatus::Accepted
            }
            FC_NPU_READ => {
                if npu.bip.upline_pending().is_none() {
                    // Nothing to read; the PPU sees the declined function
                    // and polls status again later.
                    return FcStatus::Declined;
                }
                if let Some(bp) = npu.bip.upline_pending_mut() {
                    bp.offset = 0;
                }
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_NPU_WRITE_SVM => {
                if npu.bip.begin_downline(BipState::DownSvm) {
                    self.fcode = code;
                    FcStatus::Accepted
                } else {
                    FcStatus::Declined // out of buffers
                }
            }
            FC_NPU_WRITE_DATA_LOW => {
                if npu.bip.begin_downline(BipState::DownDataLow) {
                    self.fcode = code;
                    FcStatus::Accepted
                } else {
                    FcStatus::Declined
                }
            }
            FC_NPU_WRITE_DATA_HIGH => {
                if npu.bip.begin_downline(BipState::DownDataHigh) {
                    self.fcode = code;
                    FcStatus::Accepted
                } else {
                    FcStatus::Declined
                }
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        let mut npu = self.npu.lock().expect("npu lock");

        match self.fcode {
            FC_NPU_STATUS => {
                if !ch.full && !self.status_sent {
                    let mut status = 0;
                    if npu.bip.upline_pending().is_some() {
                        status |= ST_NPU_UPLINE_AVAILABLE;
                    }
                    if npu.bip.buffer_count() < BUFFERS_LOW {
                        status |= ST_NPU_BUFFERS_LOW;
                    }
                    ch.data = status;
                    ch.full = true;
                    self.status_sent = true;
                }
            }
            FC_NPU_READ => {
                if ch.full {
                    return;
                }
                let done = match npu.bip.upline_pending_mut() {
                    Some(bp) => {
                        if bp.offset < bp.num_bytes {
                            ch.data = bp.data[bp.offset as usize] as PpWord;
                            ch.full = true;
                            bp.offset += 1;
                            false
                        } else {
                            true
                        }
                    }
                    None => true,
                };
                if done && !ch.disc_after_input {
                    ch.disc_after_input = true;
                    ch.delay_disconnect = 2;
                }
            }
            FC_NPU_WRITE_SVM | FC_NPU_WRITE_DATA_LOW | FC_NPU_WRITE_DATA_HIGH => {
                if ch.full {
                    npu.bip.downline_byte((ch.data & 0o377) as u8);
                    ch.full = false;
                }
            }
            _ => {}
        }
    }

    fn disconnect(&mut self, _ch: &mut ChannelState) {
        let mut npu = self.npu.lock().expect("npu lock");

        match self.fcode {
            FC_NPU_READ => {
                // The host consumed the upline block.
                npu.bip.notify_upline_sent();
            }
            FC_NPU_WRITE_SVM | FC_NPU_WRITE_DATA_LOW | FC_NPU_WRITE_DATA_HIGH => {
                if let Some((bp, state)) = npu.bip.finish_downline() {
                    match state {
                        BipState::DownSvm => npu.svm_process_buffer(bp),
                        BipState::DownDataLow => npu.tip_process_buffer(bp, 0),
                        BipState::DownDataHigh => npu.tip_process_buffer(bp, 1),
                        BipState::Idle => npu.bip.release_buffer(bp),
                    }
                }
            }
            _ => {}
        }
        self.fcode = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
