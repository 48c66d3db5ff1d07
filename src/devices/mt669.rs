//! 669-class magnetic tape drive
//!
//! Tape images are SIMH-TAP files: every record is framed by a 32-bit
//! record length, stored little-endian on disk regardless of host byte
//! order, with the data padded to an even length. A zero length marks a
//! tape mark; running off the end of the file is end of medium.
//!
//! Data moves over the channel one frame per word, in the low 8 bits.
//! At the end of a read record the drive disconnects the channel after a
//! short delay, which is what terminates the PPU's IAM.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::channel::ChannelState;
use crate::device::{Device, DeviceKind, FcStatus, MAX_UNITS};
use crate::devices::DeviceError;
use crate::words::PpWord;

// Function codes.
pub const FC_CONNECT_UNIT: PpWord = 0o0000; // 0000-0007: connect unit
pub const FC_REWIND: PpWord = 0o0010;
pub const FC_GENERAL_STATUS: PpWord = 0o0012;
pub const FC_DETAILED_STATUS: PpWord = 0o0013;
pub const FC_READ_FWD: PpWord = 0o0040;
pub const FC_WRITE: PpWord = 0o0050;
pub const FC_WRITE_MARK: PpWord = 0o0051;
pub const FC_BACKSPACE: PpWord = 0o0060;

// General status bits.
pub const ST_READY: PpWord = 0o0001;
pub const ST_WRITE_ENABLE: PpWord = 0o0002;
pub const ST_LOAD_POINT: PpWord = 0o0004;
pub const ST_TAPE_MARK: PpWord = 0o0010;
pub const ST_END_OF_MEDIUM: PpWord = 0o0020;
pub const ST_ERROR: PpWord = 0o0040;

/// Number of detailed status words delivered.
const DETAILED_STATUS_LEN: usize = 8;

/// One mounted tape.
struct TapeUnit {
    path: PathBuf,
    file: File,
    /// Record count from load point.
    block_no: u32,
    /// Write ring present.
    write_enabled: bool,
    status: PpWord,
    detailed: [PpWord; DETAILED_STATUS_LEN],
}

impl TapeUnit {
    fn open(path: &Path, write_enabled: bool) -> Result<TapeUnit, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| DeviceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(TapeUnit {
            path: path.to_path_buf(),
            file,
            block_no: 0,
            write_enabled,
            status: ST_READY | ST_LOAD_POINT | if write_enabled { ST_WRITE_ENABLE } else { 0 },
            detailed: [0; DETAILED_STATUS_LEN],
        })
    }

    fn latch_error(&mut self, code: PpWord) {
        self.status |= ST_ERROR;
        self.detailed[1] = code;
        self.detailed[2] = (self.block_no & 0o7777) as PpWord;
    }

    /// Read the next TAP record. Ok(None) is a tape mark; an Err latches
    /// into status and reads as end of medium.
    fn read_record(&mut self) -> std::io::Result<Option<Option<Vec<u8>>>> {
        let mut frame = [0u8; 4];
        match self.file.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(frame);
        if len == 0 {
            self.block_no += 1;
            return Ok(Some(None)); // tape mark
        }

        let padded = (len + 1) & !1;
        let mut data = vec![0u8; padded as usize];
        self.file.read_exact(&mut data)?;
        data.truncate(len as usize);

        let mut trailer = [0u8; 4];
        self.file.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "record trailer does not match header",
            ));
        }

        self.block_no += 1;
        self.status &= !ST_LOAD_POINT;
        Ok(Some(Some(data)))
    }

    fn write_record(&mut self, data: &[u8]) -> std::io::Result<()> {
        let len = data.len() as u32;
        let frame = len.to_le_bytes();
        self.file.write_all(&frame)?;
        self.file.write_all(data)?;
        if len & 1 != 0 {
            self.file.write_all(&[0])?;
        }
        self.file.write_all(&frame)?;
        self.block_no += 1;
        self.status &= !ST_LOAD_POINT;
        Ok(())
    }

    fn write_mark(&mut self) -> std::io::Result<()> {
        self.file.write_all(&0u32.to_le_bytes())?;
        self.block_no += 1;
        Ok(())
    }

    fn rewind(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.block_no = 0;
        self.status |= ST_LOAD_POINT;
        self.status &= !(ST_TAPE_MARK | ST_END_OF_MEDIUM);
        Ok(())
    }

    /// Step back over one record or tape mark.
    fn backspace(&mut self) -> std::io::Result<()> {
        let pos = self.file.stream_position()?;
        if pos < 4 {
            self.status |= ST_LOAD_POINT;
            return Ok(());
        }

        self.file.seek(SeekFrom::Current(-4))?;
        let mut frame = [0u8; 4];
        self.file.read_exact(&mut frame)?;
        let len = u32::from_le_bytes(frame);

        if len == 0 {
            self.file.seek(SeekFrom::Current(-4))?;
        } else {
            let padded = (len + 1) & !1;
            self.file.seek(SeekFrom::Current(-(8 + padded as i64)))?;
        }
        self.block_no = self.block_no.saturating_sub(1);
        if self.file.stream_position()? == 0 {
            self.status |= ST_LOAD_POINT;
        }
        Ok(())
    }
}

/// What the latched function code is moving.
enum Transfer {
    Idle,
    /// Reading a record; the bytes and the delivery position.
    Read(Vec<u8>, usize),
    /// Collecting a record to write.
    Write(Vec<u8>),
    /// Delivering status words.
    Status(Vec<PpWord>, usize),
}

/// 669 controller with up to eight transports.
pub struct Mt669 {
    pub eq_no: u8,
    selected_unit: usize,
    fcode: PpWord,
    units: [Option<TapeUnit>; MAX_UNITS],
    transfer: Transfer,
}

impl Mt669 {
    pub fn new(eq_no: u8) -> Self {
        Self {
            eq_no,
            selected_unit: 0,
            fcode: 0,
            units: Default::default(),
            transfer: Transfer::Idle,
        }
    }

    /// Mount an image on a unit (the operator "load tape" path).
    pub fn load_unit(
        &mut self,
        unit: u8,
        path: &Path,
        write_enabled: bool,
    ) -> Result<(), DeviceError> {
        let slot = self
            .units
            .get_mut(unit as usize)
            .ok_or(DeviceError::BadUnit { unit })?;
        *slot = Some(TapeUnit::open(path, write_enabled)?);
        debug!("mt669 eq {} unit {}: loaded {}", self.eq_no, unit, path.display());
        Ok(())
    }

    /// Dismount a unit (the operator "unload tape" path).
    pub fn unload_unit(&mut self, unit: u8) -> Result<(), DeviceError> {
        let slot = self
            .units
            .get_mut(unit as usize)
            .ok_or(DeviceError::BadUnit { unit })?;
        if let Some(u) = slot.take() {
            debug!("mt669 eq {} unit {}: unloaded {}", self.eq_no, unit, u.path.display());
        }
        Ok(())
    }

    fn unit(&mut self) -> Option<&mut TapeUnit> {
        self.units[self.selected_unit].as_mut()
    }

    /// Finish a write in progress: frame and flush the collected record.
    fn flush_write(&mut self) {
        if let Transfer::Write(data) = std::mem::replace(&mut self.transfer, Transfer::Idle) {
            if data.is_empty() {
                return;
            }
            if let Some(unit) = self.unit() {
                if !unit.write_enabled {
                    unit.latch_error(0o01); // missing ring
                    return;
                }
                if let Err(e) = unit.write_record(&data) {
                    warn!("mt669: write failed: {}", e);
                    unit.latch_error(0o02);
                }
            }
        }
    }
}

impl Device for Mt669 {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Mt669
    }

    fn func(&mut self, _ch: &mut ChannelState, code: PpWord) -> FcStatus {
        // Unit connects carry the unit number in the low octal digit.
        if (FC_CONNECT_UNIT..FC_CONNECT_UNIT + MAX_UNITS as PpWord).contains(&code) {
            self.selected_unit = (code & 0o7) as usize;
            return FcStatus::Processed;
        }

        match code {
            FC_REWIND => {
                if let Some(unit) = self.unit() {
                    if let Err(e) = unit.rewind() {
                        warn!("mt669: rewind failed: {}", e);
                        unit.latch_error(0o03);
                    }
                }
                FcStatus::Processed
            }
            FC_BACKSPACE => {
                if let Some(unit) = self.unit() {
                    if let Err(e) = unit.backspace() {
                        warn!("mt669: backspace failed: {}", e);
                        unit.latch_error(0o03);
                    }
                }
                FcStatus::Processed
            }
            FC_WRITE_MARK => {
                if let Some(unit) = self.unit() {
                    if let Err(e) = unit.write_mark() {
                        warn!("mt669: write mark failed: {}", e);
                        unit.latch_error(0o02);
                    }
                }
                FcStatus::Processed
            }
            FC_READ_FWD => {
                let transfer = match self.unit() {
                    Some(unit) => match unit.read_record() {
                        Ok(Some(Some(data))) => Transfer::Read(data, 0),
                        Ok(Some(None)) => {
                            unit.status |= ST_TAPE_MARK;
                            Transfer::Read(Vec::new(), 0)
                        }
                        Ok(None) => {
                            unit.status |= ST_END_OF_MEDIUM;
                            Transfer::Read(Vec::new(), 0)
                        }
                        Err(e) => {
                            warn!("mt669: read failed: {}", e);
                            unit.latch_error(0o04);
                            Transfer::Read(Vec::new(), 0)
                        }
                    },
                    None => Transfer::Read(Vec::new(), 0), // blank: no unit
                };
                self.transfer = transfer;
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_WRITE => {
                self.transfer = Transfer::Write(Vec::new());
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_GENERAL_STATUS => {
                let status = match &self.units[self.selected_unit] {
                    Some(unit) => unit.status,
                    None => 0,
                };
                self.transfer = Transfer::Status(vec![status], 0);
                self.fcode = code;
                FcStatus::Accepted
            }
            FC_DETAILED_STATUS => {
                let words = match &self.units[self.selected_unit] {
                    Some(unit) => unit.detailed.to_vec(),
                    None => vec![0; DETAILED_STATUS_LEN],
                };
                self.transfer = Transfer::Status(words, 0);
                self.fcode = code;
                FcStatus::Accepted
            }
            _ => FcStatus::Declined,
        }
    }

    fn io(&mut self, ch: &mut ChannelState) {
        match &mut self.transfer {
            Transfer::Read(data, pos) => {
                if ch.full {
                    return;
                }
                if *pos < data.len() {
                    ch.data = data[*pos] as PpWord;
                    ch.full = true;
                    *pos += 1;
                } else if !ch.disc_after_input {
                    // Record exhausted: disconnect shortly, ending the IAM.
                    ch.disc_after_input = true;
                    ch.delay_disconnect = 2;
                }
            }
            Transfer::Write(data) => {
                if ch.full {
                    data.push((ch.data & 0o377) as u8);
                    ch.full = false;
                }
            }
            Transfer::Status(words, pos) => {
                if ch.full {
                    return;
                }
                if *pos < words.len() {
                    ch.data = words[*pos];
                    ch.full = true;
                    *pos += 1;
                } else if !ch.disc_after_input {
                    ch.disc_after_input = true;
                    ch.delay_disconnect = 2;
                }
            }
            Transfer::Idle => {}
        }
    }

    fn disconnect(&mut self, _ch: &mut ChannelState) {
        if self.fcode == FC_WRITE {
            self.flush_write();
        } else {
            self.transfer = Transfer::Idle;
        }
        self.fcode = 0;
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
