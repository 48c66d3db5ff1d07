//! Block Interface Protocol
//!
//! BIP owns the buffer pool and moves blocks between the host channel and
//! the upper layers. Downline (host to NPU), the host announces a block
//! with an order word - service message, low-priority data or
//! high-priority data - and BIP collects the bytes into a buffer, handing
//! it to SVM or TIP when the channel disconnects. Upline, one transfer
//! slot holds the block the host is reading; further blocks queue behind
//! it.

use log::warn;

use crate::npu::buffer::{BufferPool, NpuBuffer, NpuQueue};

/// Downline collection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BipState {
    Idle,
    DownSvm,
    DownDataLow,
    DownDataHigh,
}

pub struct Bip {
    pool: BufferPool,
    pub state: BipState,
    /// Block the host is currently reading.
    upline: Option<Box<NpuBuffer>>,
    /// Blocks waiting behind it.
    upline_queue: NpuQueue,
    /// Block being collected from the host.
    downline: Option<Box<NpuBuffer>>,
}

impl Bip {
    pub fn new() -> Bip {
        Bip {
            pool: BufferPool::new(),
            state: BipState::Idle,
            upline: None,
            upline_queue: NpuQueue::new(),
            downline: None,
        }
    }

    /// Release everything back to the pool and go idle.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.upline.take() {
            self.pool.release(buffer);
        }
        while let Some(buffer) = self.upline_queue.extract() {
            self.pool.release(buffer);
        }
        if let Some(buffer) = self.downline.take() {
            self.pool.release(buffer);
        }
        self.state = BipState::Idle;
    }

    // ========== Pool access for the upper layers ==========

    pub fn buffer_count(&self) -> usize {
        self.pool.count()
    }

    pub fn get_buffer(&mut self) -> Option<Box<NpuBuffer>> {
        self.pool.get()
    }

    pub fn release_buffer(&mut self, buffer: Box<NpuBuffer>) {
        self.pool.release(buffer);
    }

    // ========== Downline path ==========

    /// Host order word announcing a downline block. Returns false when
    /// the pool is dry, in which case the order is ignored and the host
    /// retries.
    pub fn begin_downline(&mut self, state: BipState) -> bool {
        if self.state != BipState::Idle {
            warn!("npu bip: downline order while busy, dropping in-flight block");
            self.abort_downline();
        }
        match self.pool.get() {
            Some(buffer) => {
                self.downline = Some(buffer);
                self.state = state;
                true
            }
            None => false,
        }
    }

    /// One byte of the downline block.
    pub fn downline_byte(&mut self, byte: u8) {
        if let Some(buffer) = &mut self.downline {
            if !buffer.push(byte) {
                warn!("npu bip: downline block overflows buffer, truncating");
            }
        }
    }

    /// Downline transfer complete: hand the buffer to the caller for
    /// dispatch to SVM or TIP, returning to idle.
    pub fn finish_downline(&mut self) -> Option<(Box<NpuBuffer>, BipState)> {
        let state = self.state;
        self.state = BipState::Idle;
        self.downline.take().map(|buffer| (buffer, state))
    }

    /// Downline transfer aborted: drop the buffer, return to idle.
    pub fn abort_downline(&mut self) {
        if let Some(buffer) = self.downline.take() {
            self.pool.release(buffer);
        }
        self.state = BipState::Idle;
    }

    // ========== Upline path ==========

    /// Queue a block for the host. It becomes the active transfer at
    /// once when the slot is free.
    pub fn request_upline_transfer(&mut self, buffer: Box<NpuBuffer>) {
        if self.upline.is_some() {
            self.upline_queue.append(buffer);
        } else {
            self.upline = Some(buffer);
        }
    }

    /// Queue a canned message for the host.
    pub fn request_upline_canned(&mut self, message: &[u8]) {
        match self.pool.get() {
            Some(mut buffer) => {
                buffer.fill(message);
                self.request_upline_transfer(buffer);
            }
            None => warn!("npu bip: canned upline message dropped, out of buffers"),
        }
    }

    /// The block the host should read next, if any.
    pub fn upline_pending(&self) -> Option<&NpuBuffer> {
        self.upline.as_deref()
    }

    pub fn upline_pending_mut(&mut self) -> Option<&mut NpuBuffer> {
        self.upline.as_deref_mut()
    }

    /// Host finished reading the active block: release it and promote the
    /// next queued one.
    pub fn notify_upline_sent(&mut self) {
        if let Some(buffer) = self.upline.take() {
            self.pool.release(buffer);
        }
        self.upline = self.upline_queue.extract();
    }
}

impl Default for Bip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downline_collection_and_dispatch() {
        let mut bip = Bip::new();
        assert!(bip.begin_downline(BipState::DownSvm));
        for &b in b"\x01\x02\x00\x04" {
            bip.downline_byte(b);
        }
        let (buffer, state) = bip.finish_downline().unwrap();
        assert_eq!(state, BipState::DownSvm);
        assert_eq!(buffer.content(), b"\x01\x02\x00\x04");
        assert_eq!(bip.state, BipState::Idle);
        bip.release_buffer(buffer);
    }

    #[test]
    fn test_upline_slot_and_queue() {
        let mut bip = Bip::new();
        let mut first = bip.get_buffer().unwrap();
        first.fill(b"one");
        let mut second = bip.get_buffer().unwrap();
        second.fill(b"two");

        bip.request_upline_transfer(first);
        bip.request_upline_transfer(second);
        assert_eq!(bip.upline_pending().unwrap().content(), b"one");

        // Completion promotes the queued block.
        bip.notify_upline_sent();
        assert_eq!(bip.upline_pending().unwrap().content(), b"two");
        bip.notify_upline_sent();
        assert!(bip.upline_pending().is_none());
    }

    #[test]
    fn test_canned_messages_queue_in_order() {
        let mut bip = Bip::new();
        bip.request_upline_canned(b"alpha");
        bip.request_upline_canned(b"beta");
        assert_eq!(bip.upline_pending().unwrap().content(), b"alpha");
        bip.notify_upline_sent();
        assert_eq!(bip.upline_pending().unwrap().content(), b"beta");
    }

    #[test]
    fn test_reset_returns_buffers() {
        let mut bip = Bip::new();
        let total = bip.buffer_count();
        bip.request_upline_canned(b"x");
        bip.request_upline_canned(b"y");
        assert!(bip.begin_downline(BipState::DownDataLow));
        assert_eq!(bip.buffer_count(), total - 3);

        bip.reset();
        assert_eq!(bip.buffer_count(), total);
        assert_eq!(bip.state, BipState::Idle);
    }

    #[test]
    fn test_abort_downline() {
        let mut bip = Bip::new();
        let total = bip.buffer_count();
        assert!(bip.begin_downline(BipState::DownDataHigh));
        bip.downline_byte(1);
        bip.abort_downline();
        assert_eq!(bip.state, BipState::Idle);
        assert_eq!(bip.buffer_count(), total);
    }
}
