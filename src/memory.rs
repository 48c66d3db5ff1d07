//! Central memory
//!
//! One bank of 60-bit words per mainframe, sized 40000B..4000000B by the
//! profile. The store is word-atomic: the scheduler thread (PPUs, CPU 0,
//! channels) and the second CPU thread touch it concurrently, and a 60-bit
//! word is always read or written as a unit. Cross-word atomicity - the
//! 16-word exchange package swap - is provided by the exchange gate in
//! `sched`, not here.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::words::{CpWord, MASK60};

/// Central memory of one mainframe.
pub struct CentralMemory {
    words: Vec<AtomicU64>,
}

impl CentralMemory {
    /// Allocate and clear a bank of `size` 60-bit words.
    pub fn new(size: u32) -> Self {
        let mut words = Vec::with_capacity(size as usize);
        words.resize_with(size as usize, || AtomicU64::new(0));
        Self { words }
    }

    /// Memory size in words.
    pub fn size(&self) -> u32 {
        self.words.len() as u32
    }

    /// Read the word at an absolute address. Addresses wrap modulo the
    /// memory size, matching the address decode of the hardware.
    pub fn read(&self, addr: u32) -> CpWord {
        let idx = addr as usize % self.words.len();
        self.words[idx].load(Ordering::SeqCst)
    }

    /// Write the word at an absolute address, masked to 60 bits.
    pub fn write(&self, addr: u32, word: CpWord) {
        let idx = addr as usize % self.words.len();
        self.words[idx].store(word & MASK60, Ordering::SeqCst);
    }

    /// Clear all of memory. Used by deadstart.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let cm = CentralMemory::new(0o40000);
        cm.write(0o100, 0o1234567);
        assert_eq!(cm.read(0o100), 0o1234567);
        assert_eq!(cm.read(0o101), 0);
    }

    #[test]
    fn test_write_masks_to_60_bits() {
        let cm = CentralMemory::new(0o40000);
        cm.write(0, u64::MAX);
        assert_eq!(cm.read(0), MASK60);
    }

    #[test]
    fn test_address_wraps_modulo_size() {
        let cm = CentralMemory::new(0o40000);
        cm.write(0o40001, 7);
        assert_eq!(cm.read(1), 7);
    }
}
