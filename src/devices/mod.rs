//! Device back-ends
//!
//! One file per device model:
//! - `mt669`: magnetic tape drive over SIMH-TAP images
//! - `cr405`: card reader
//! - `lp501`: line printer (501 and 512 share the implementation)
//! - `console`: console display/keyboard stream
//! - `hardwired`: interlock, status-and-control and maintenance registers
//!
//! Every back-end obeys the channel contract: never block a channel step
//! for longer than one host system call, never hold scheduler state across
//! a network call, tolerate `io` with the channel not full.

pub mod console;
pub mod cr405;
pub mod hardwired;
pub mod lp501;
pub mod mt669;

use std::path::PathBuf;

use thiserror::Error;

/// Device back-end errors. Fatal ones surface at attach time; runtime I/O
/// problems latch into per-device detailed status instead.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("device on channel {channel:o} requires a file name")]
    MissingFile { channel: u8 },
    #[error("no matching device on channel {channel:o}")]
    NoSuchDevice { channel: u8 },
    #[error("unit number {unit} out of range")]
    BadUnit { unit: u8 },
}
