//! Console display and keyboard
//!
//! The core models the console as a logical character stream: output
//! display codes accumulate in a screen buffer the front-end window
//! drains, and keystrokes arrive through a queue the front-end fills.
//! Rendering and rate-limiting of the keystroke source live in the
//! front-end, not here.

use std::collections::VecDeque;

use crate::channel::ChannelState;
use crate::charset::{ascii_to_cdc, cdc_to_ascii};
use crate::device::{Device, DeviceKind, FcStatus};
use crate::words::PpWord;

// Function codes.
pub const FC_SELECT_LEFT: PpWord = 0o7001;
pub const FC_SELECT_RIGHT: PpWord = 0o7002;
pub const FC_OUTPUT: PpWord = 0o7010;
pub const FC_READ_KEY: PpWord = 0o7020;

/// Maximum buffered output before the oldest characters drop.
const SCREEN_LIMIT: usize = 0o100000;

/// The console stream device.
pub struct Console {
    /// Accumulated display output as ASCII, drained by the front-end.
    screen: VecDeque<u8>,
    /// Pending keystrokes from the front-end.
    keys: VecDeque<u8>,
    fcode: PpWord,
}

impl Console {
    pub fn new() -> Self {
        Self {
            screen: VecDeque::new(),
            keys: VecDeque::new(),
            fcode: 0,
        }
    }

    /// Front-end: queue a keystroke.
    pub fn push_key(&mut self, key: u8) {
        self.keys.push_back(key);
    }

    /// Front-end: take everything written to the screen so far.
    pub fn drain_screen(&mut self) -> Vec<u8> {
        self.screen.drain(..).collect()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Console {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Console
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        match code {
            FC_SELECT_LEFT | FC_SELECT_RIGHT => FcStatus::Processed,
            FC_OUTPUT | FC_READ_KEY => {
                self.fcode = code;
                FcStatus::Accepted
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        match self.fcode {
            FC_OUTPUT => {
                if ch.full {
                    // Two display codes per channel word.
                    for code in [(ch.data >> 6) & 0o77, ch.data & 0o77] {
                        self.screen.push_back(cdc_to_ascii(code as u8));
                    }
                    if self.screen.len() > SCREEN_LIMIT {
                        self.screen.drain(..self.screen.len() - SCREEN_LIMIT);
                    }
                    ch.full = false;
                }
            }
            FC_READ_KEY => {
                if !ch.full {
                    // An empty queue reads as zero, not as a stall; the
                    // guest polls the keyboard continuously.
                    let key = self.keys.pop_front().map(ascii_to_cdc).unwrap_or(0);
                    ch.data = key as PpWord;
                    ch.full = true;
                }
            }
            _ => {}
        }
    }

    fn disconnect(&mut self, _ch: &mut ChannelState) {
        self.fcode = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_state() -> ChannelState {
        ChannelState {
            id: 0o10,
            active: true,
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

    #[test]
    fn test_output_stream() {
        let mut con = Console::new();
        let mut ch = channel_state();
        assert_eq!(con.func(&mut ch, FC_OUTPUT), FcStatus::Accepted);

        // "AB" packed two codes to a word.
        ch.data = ((0o01 << 6) | 0o02) as PpWord;
        ch.full = true;
        con.io(&mut ch);
        assert!(!ch.full);
        assert_eq!(con.drain_screen(), b"AB");
    }

    #[test]
    fn test_keyboard_queue() {
        let mut con = Console::new();
        let mut ch = channel_state();
        con.push_key(b'X');
        assert_eq!(con.func(&mut ch, FC_READ_KEY), FcStatus::Accepted);

        con.io(&mut ch);
        assert!(ch.full);
        assert_eq!(ch.data, ascii_to_cdc(b'X') as PpWord);

        // Queue empty: zero, still full.
        ch.full = false;
        con.io(&mut ch);
        assert!(ch.full);
        assert_eq!(ch.data, 0);
    }

    #[test]
    fn test_unknown_function_declined() {
        let mut con = Console::new();
        let mut ch = channel_state();
        assert_eq!(con.func(&mut ch, 0o1111), FcStatus::Declined);
    }
}
