//! CDC 6000/Cyber-series mainframe emulator core
//!
//! A cycle-accurate virtual machine for the Control Data 6000/70/170/800
//! family: one or two 60-bit central processors, ten or twenty 12-bit
//! peripheral processors, and a bank of I/O channels connecting the PPUs
//! to their devices, paced by a real-time clock. The simulated Network
//! Processing Unit terminates TCP connections for the guest's terminal
//! network.
//!
//! # Architecture
//!
//! - `words`: word types and ones-complement arithmetic
//! - `memory` / `extended`: central memory and ECS/ESM
//! - `cpu`: the 60-bit instruction set and the exchange jump
//! - `ppu`: the 12-bit instruction set with channel-coupled I/O
//! - `channel` / `device`: the channel state machine and the device
//!   capability set
//! - `devices`: tape, card, printer, console and register back-ends
//! - `clock`: the real-time clock and the major-cycle counter
//! - `npu`: buffer pool and the BIP/SVM/TIP protocol layers
//! - `sched`: mainframe assembly, the major-cycle loop and the threads
//! - `config`: the startup profile
//! - `charset` / `trace`: display code tables and diagnostics
//!
//! # Execution model
//!
//! Each mainframe's primary thread runs the major cycle: step every PPU
//! once, step CPU 0 `cpuratio` times, step every channel, tick the
//! clock. A second CPU thread, when configured, is signalled at the CPU
//! phase and steps CPU 1 against central memory only. One process-wide
//! flag gates every loop for shutdown.

pub mod channel;
pub mod charset;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod device;
pub mod devices;
pub mod extended;
pub mod memory;
pub mod npu;
pub mod ppu;
pub mod sched;
pub mod trace;
pub mod words;

#[cfg(test)]
mod npu_integration_test;
#[cfg(test)]
mod system_integration_test;

pub use config::{ModelType, SystemConfig};
pub use sched::{Mainframe, System};
