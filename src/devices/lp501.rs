//! 501/512 line printers
//!
//! Output words arrive as display codes in the low 6 bits; print functions
//! select carriage control. The printer appends to a text file; the
//! operator "remove paper" request truncates it and resets the line
//! counter, after which subsequent output starts a fresh page with no
//! interleaving.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, warn};

use crate::channel::ChannelState;
use crate::charset::cdc_to_ascii;
use crate::device::{Device, DeviceKind, FcStatus};
use crate::devices::DeviceError;
use crate::words::PpWord;

// Function codes.
pub const FC_SELECT: PpWord = 0o0001;
pub const FC_PRINT: PpWord = 0o0040;
pub const FC_EJECT_PAGE: PpWord = 0o0042;
pub const FC_STATUS: PpWord = 0o0012;

// Status bits.
pub const ST_READY: PpWord = 0o0001;

/// Lines per page for the page-eject bookkeeping.
const PAGE_LINES: u32 = 60;

/// A 501-class line printer.
pub struct Lp501 {
    pub eq_no: u8,
    kind: DeviceKind,
    path: PathBuf,
    file: Option<File>,
    line: Vec<u8>,
    line_count: u32,
    fcode: PpWord,
}

impl Lp501 {
    /// Open (appending) the printer output file.
    pub fn new(eq_no: u8, kind: DeviceKind, path: &Path) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| DeviceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            eq_no,
            kind,
            path: path.to_path_buf(),
            file: Some(file),
            line: Vec::new(),
            line_count: 0,
            fcode: 0,
        })
    }

    /// Operator "remove paper": truncate the output file and reset the
    /// line counter. Subsequent output appends to a fresh file.
    pub fn remove_paper(&mut self) -> Result<(), DeviceError> {
        self.flush_line();
        self.file = None;
        let file = File::create(&self.path).map_err(|source| DeviceError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file = Some(file);
        self.line_count = 0;
        debug!(
            "lp eq {}: paper removed at {}",
            self.eq_no,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    fn flush_line(&mut self) {
        if let Some(file) = &mut self.file {
            if !self.line.is_empty() || self.fcode == FC_PRINT {
                self.line.push(b'\n');
                if let Err(e) = file.write_all(&self.line) {
                    warn!("lp eq {}: write failed: {}", self.eq_no, e);
                }
                self.line.clear();
                self.line_count += 1;
            }
        }
    }

    fn eject(&mut self) {
        self.flush_line();
        if let Some(file) = &mut self.file {
            let _ = file.write_all(b"\x0c");
        }
        self.line_count = self.line_count.next_multiple_of(PAGE_LINES);
    }
}

impl Device for Lp501 {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        match code {
            FC_SELECT => FcStatus::Processed,
            FC_PRINT => {
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_EJECT_PAGE => {
                self.eject();
                FcStatus::Processed
            }
            FC_STATUS => {
                self.fcode = code;
                FcStatus::Accepted
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        match self.fcode {
            FC_PRINT => {
                if ch.full {
                    self.line.push(cdc_to_ascii((ch.data & 0o77) as u8));
                    ch.full = false;
                }
            }
            FC_STATUS => {
                if !ch.full {
                    ch.data = ST_READY;
                    ch.full = true;
                }
            }
            _ => {}
        }
    }

    fn disconnect(&mut self, _ch: &mut ChannelState) {
        if self.fcode == FC_PRINT {
            self.flush_line();
        }
        self.fcode = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn channel_state() -> ChannelState {
        ChannelState {
            id: 0o12,
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

    fn print_line(lp: &mut Lp501, ch: &mut ChannelState, text: &str) {
        assert_eq!(lp.func(ch, FC_PRINT), FcStatus::Accepted);
        for byte in text.bytes() {
            ch.data = crate::charset::ascii_to_cdc(byte) as PpWord;
            ch.full = true;
            lp.io(ch);
            assert!(!ch.full);
        }
        lp.disconnect(ch);
    }

    #[test]
    fn test_print_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("print.txt");
        let mut lp = Lp501::new(5, DeviceKind::Lp501, &path).unwrap();
        let mut ch = channel_state();

        print_line(&mut lp, &mut ch, "DAYFILE");
        print_line(&mut lp, &mut ch, "LINE 2.");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "DAYFILE\nLINE 2.\n");
        assert_eq!(lp.line_count, 2);
    }

    #[test]
    fn test_remove_paper_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("print.txt");
        let mut lp = Lp501::new(5, DeviceKind::Lp501, &path).unwrap();
        let mut ch = channel_state();

        print_line(&mut lp, &mut ch, "OLD OUTPUT");
        lp.remove_paper().unwrap();
        assert_eq!(lp.line_count, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        // Fresh output lands in the truncated file, no interleaving.
        print_line(&mut lp, &mut ch, "NEW OUTPUT");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "NEW OUTPUT\n");
    }

    #[test]
    fn test_status_function() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("print.txt");
        let mut lp = Lp501::new(5, DeviceKind::Lp512, &path).unwrap();
        let mut ch = channel_state();

        assert_eq!(lp.func(&mut ch, FC_STATUS), FcStatus::Accepted);
        lp.io(&mut ch);
        assert!(ch.full);
        assert_eq!(ch.data, ST_READY);
        assert_eq!(lp.kind(), DeviceKind::Lp512);
    }
}
