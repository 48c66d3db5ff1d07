//! 405 card reader
//!
//! Decks are text files, one card per line, at most 80 columns. Each
//! column goes over the channel as one 12-bit word carrying the display
//! code of the character. A line beginning with `~eoi` ends the deck the
//! way an end-of-information card does.

use std::fs;
use std::path::Path;

use log::debug;

use crate::channel::ChannelState;
use crate::charset::ascii_to_cdc;
use crate::device::{Device, DeviceKind, FcStatus};
use crate::devices::DeviceError;
use crate::words::PpWord;

// Function codes.
pub const FC_SELECT: PpWord = 0o0001;
pub const FC_READ_CARD: PpWord = 0o0040;
pub const FC_STATUS: PpWord = 0o0012;

// Status bits.
pub const ST_READY: PpWord = 0o0001;
pub const ST_EOI: PpWord = 0o0010;
pub const ST_HOPPER_EMPTY: PpWord = 0o0020;

/// Columns per card.
pub const CARD_COLUMNS: usize = 80;

/// Card reader over a loaded deck.
pub struct Cr405 {
    pub eq_no: u8,
    cards: Vec<[PpWord; CARD_COLUMNS]>,
    next_card: usize,
    eoi: bool,
    /// Card being delivered and the column position.
    current: Option<([PpWord; CARD_COLUMNS], usize)>,
    fcode: PpWord,
}

impl Cr405 {
    pub fn new(eq_no: u8) -> Self {
        Self {
            eq_no,
            cards: Vec::new(),
            next_card: 0,
            eoi: false,
            current: None,
            fcode: 0,
        }
    }

    /// Load a deck file into the hopper.
    pub fn load_deck(&mut self, path: &Path) -> Result<(), DeviceError> {
        let text = fs::read_to_string(path).map_err(|source| DeviceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.cards.clear();
        self.next_card = 0;
        self.eoi = false;
        for line in text.lines() {
            if line.starts_with("~eoi") {
                break;
            }
            let mut card = [ascii_to_cdc(b' ') as PpWord; CARD_COLUMNS];
            for (col, byte) in line.bytes().take(CARD_COLUMNS).enumerate() {
                card[col] = ascii_to_cdc(byte) as PpWord;
            }
            self.cards.push(card);
        }
        debug!("cr405 eq {}: loaded {} cards", self.eq_no, self.cards.len());
        Ok(())
    }

    fn status(&self) -> PpWord {
        let mut status = ST_READY;
        if self.next_card >= self.cards.len() {
            status |= ST_HOPPER_EMPTY;
        }
        if self.eoi {
            status |= ST_EOI;
        }
        status
    }
}

impl Device for Cr405 {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cr405
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        match code {
            FC_SELECT => FcStatus::Processed,
            FC_READ_CARD => {
                if self.next_card < self.cards.len() {
                    self.current = Some((self.cards[self.next_card], 0));
                    self.next_card += 1;
                    if self.next_card == self.cards.len() {
                        self.eoi = true;
                    }
                } else {
                    self.eoi = true;
                    self.current = None;
                }
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_STATUS => {
                self.fcode = code;
                FcStatus::Accepted
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        if ch.full {
            return;
        }
        match self.fcode {
            FC_READ_CARD => match &mut self.current {
                Some((card, col)) => {
                    if *col < CARD_COLUMNS {
                        ch.data = card[*col];
                        ch.full = true;
                        *col += 1;
                    } else if !ch.disc_after_input {
                        self.current = None;
                        ch.disc_after_input = true;
                        ch.delay_disconnect = 2;
                    }
                }
                None => {
                    // Empty hopper: the channel disconnects with no data.
                    if !ch.disc_after_input {
                        ch.disc_after_input = true;
                        ch.delay_disconnect = 2;
                    }
                }
            },
            FC_STATUS => {
                ch.data = self.status();
                ch.full = true;
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
