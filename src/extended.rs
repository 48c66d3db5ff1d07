//! Extended memory (ECS / ESM)
//!
//! An auxiliary word-addressable store of up to 16 banks, shared by every
//! mainframe in the system. ECS banks reserve 5120 words per bank for the
//! controller; ESM banks are the full 131072 words. Multi-mainframe access
//! is serialised by one lock around the whole store, which also protects
//! the ECS flag register.
//!
//! When a persist directory is configured, the raw word image lives in an
//! `ecsStore` backing file that is read at startup and rewritten at
//! terminate.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};
use thiserror::Error;

use crate::words::{CpWord, MASK60};

/// Usable words per ECS bank (131072 less the 5120-word reserve).
pub const ECS_BANK_SIZE: u32 = 131072 - 5120;

/// Words per ESM bank.
pub const ESM_BANK_SIZE: u32 = 131072;

/// Backing file name inside the persist directory.
pub const STORE_FILE: &str = "ecsStore";

#[derive(Debug, Error)]
pub enum ExtendedMemoryError {
    #[error("extended memory backing file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("extended memory address {addr:o}B out of range")]
    OutOfRange { addr: u32 },
}

struct Inner {
    words: Vec<CpWord>,
    flag_register: u32,
}

/// The system-wide extended memory image.
pub struct ExtendedMemory {
    inner: Mutex<Inner>,
    size: u32,
    backing: Option<PathBuf>,
}

impl ExtendedMemory {
    /// Allocate extended memory for the configured bank counts. One of
    /// `ecs_banks`/`esm_banks` is zero (the profile parser enforces it).
    pub fn new(ecs_banks: u32, esm_banks: u32) -> Self {
        let size = ecs_banks * ECS_BANK_SIZE + esm_banks * ESM_BANK_SIZE;
        Self {
            inner: Mutex::new(Inner {
                words: vec![0; size as usize],
                flag_register: 0,
            }),
            size,
            backing: None,
        }
    }

    /// Attach a backing file in `persist_dir` and load any existing image.
    /// An image of unexpected length clears extended memory with a logged
    /// message rather than failing.
    pub fn attach_backing(&mut self, persist_dir: &Path) -> Result<(), ExtendedMemoryError> {
        let path = persist_dir.join(STORE_FILE);
        let io_err = |source| ExtendedMemoryError::Io {
            path: path.clone(),
            source,
        };

        match File::open(&path) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes).map_err(io_err)?;
                let mut inner = self.inner.lock().expect("extended memory lock");
                if bytes.len() == inner.words.len() * 8 {
                    for (word, chunk) in inner.words.iter_mut().zip(bytes.chunks_exact(8)) {
                        *word = u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk"));
                    }
                    info!("extended memory restored from {}", path.display());
                } else {
                    warn!(
                        "unexpected length of extended memory backing file, clearing ({} bytes, wanted {})",
                        bytes.len(),
                        inner.words.len() * 8
                    );
                    inner.words.fill(0);
                }
            }
            Err(_) => {
                // Create a fresh file so terminate can rewrite it in place.
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)
                    .map_err(io_err)?;
                info!("created extended memory backing file {}", path.display());
            }
        }

        self.backing = Some(path);
        Ok(())
    }

    /// Flush the word image back to the backing file, if one is attached.
    pub fn save(&self) -> Result<(), ExtendedMemoryError> {
        let path = match &self.backing {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        let io_err = |source| ExtendedMemoryError::Io {
            path: path.clone(),
            source,
        };

        let inner = self.inner.lock().expect("extended memory lock");
        let mut file = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        let mut bytes = Vec::with_capacity(inner.words.len() * 8);
        for word in &inner.words {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        file.write_all(&bytes).map_err(io_err)?;
        Ok(())
    }

    /// Total size in words.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Read one word. Out-of-range reads return an error for the caller to
    /// turn into an address exit condition.
    pub fn read(&self, addr: u32) -> Result<CpWord, ExtendedMemoryError> {
        let inner = self.inner.lock().expect("extended memory lock");
        inner
            .words
            .get(addr as usize)
            .copied()
            .ok_or(ExtendedMemoryError::OutOfRange { addr })
    }

    /// Write one word, masked to 60 bits.
    pub fn write(&self, addr: u32, word: CpWord) -> Result<(), ExtendedMemoryError> {
        let mut inner = self.inner.lock().expect("extended memory lock");
        match inner.words.get_mut(addr as usize) {
            Some(slot) => {
                *slot = word & MASK60;
                Ok(())
            }
            None => Err(ExtendedMemoryError::OutOfRange { addr }),
        }
    }

    /// Copy a block out of extended memory. The whole block is read under
    /// one lock acquisition so concurrent mainframes see a consistent
    /// snapshot.
    pub fn read_block(&self, addr: u32, out: &mut [CpWord]) -> Result<(), ExtendedMemoryError> {
        let inner = self.inner.lock().expect("extended memory lock");
        let start = addr as usize;
        let end = start + out.len();
        if end > inner.words.len() {
            return Err(ExtendedMemoryError::OutOfRange {
                addr: addr + out.len() as u32,
            });
        }
        out.copy_from_slice(&inner.words[start..end]);
        Ok(())
    }

    /// Copy a block into extended memory under one lock acquisition.
    pub fn write_block(&self, addr: u32, block: &[CpWord]) -> Result<(), ExtendedMemoryError> {
        let mut inner = self.inner.lock().expect("extended memory lock");
        let start = addr as usize;
        let end = start + block.len();
        if end > inner.words.len() {
            return Err(ExtendedMemoryError::OutOfRange {
                addr: addr + block.len() as u32,
            });
        }
        for (slot, word) in inner.words[start..end].iter_mut().zip(block) {
            *slot = word & MASK60;
        }
        Ok(())
    }

    /// Read-modify-write on the ECS flag register. `f` receives the current
    /// value and returns the new one; the old value is returned.
    pub fn update_flag_register(&self, f: impl FnOnce(u32) -> u32) -> u32 {
        let mut inner = self.inner.lock().expect("extended memory lock");
        let old = inner.flag_register;
        inner.flag_register = f(old);
        old
    }
}
