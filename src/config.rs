//! Startup profile parsing
//!
//! The emulator is configured by an INI-style profile file (`cyber.ini` by
//! convention). Sections are bracketed, entries are `key=value`, `;` starts
//! a comment. The main section selects the machine model and points at the
//! deadstart, equipment and NPU-connection sections.
//!
//! Parsing is strict: every error is fatal at startup and names the section
//! and relative line that caused it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::info;
use thiserror::Error;

use crate::device::DeviceKind;

/// Default CPU instruction words executed per PPU instruction.
pub const DEFAULT_CPU_RATIO: u32 = 4;

/// Smallest supported central memory size in words.
pub const MIN_MEMORY: u32 = 0o40000;

/// Largest supported central memory size in words.
pub const MAX_MEMORY: u32 = 0o4000000;

/// Maximum deadstart panel entries.
pub const MAX_DEADSTART: usize = 16;

bitflags! {
    /// Per-model hardware feature word.
    ///
    /// Selected by the `model` entry; individual bits gate optional
    /// instructions, register widths and hardwired channels elsewhere in
    /// the core.
    pub struct Features: u32 {
        const SERIES_6X00            = 1 << 0;
        const SERIES_70              = 1 << 1;
        const SERIES_170             = 1 << 2;
        const SERIES_800             = 1 << 3;
        /// Interlock register on channel 15.
        const INTERLOCK_REG          = 1 << 4;
        /// Status-and-control register on channel 16.
        const STATUS_CONTROL_REG     = 1 << 5;
        /// Compare/move unit instructions.
        const CMU                    = 1 << 6;
        /// Instruction stack with prefetch.
        const INSTRUCTION_STACK      = 1 << 7;
        const ISTACK_PREFETCH        = 1 << 8;
        /// 175-style floating point (underflow produces zero).
        const FLOAT_175              = 1 << 9;
        /// Field length is not wrapped; out-of-range accesses always trap.
        const NO_CM_WRAP             = 1 << 10;
        /// Clock channel holds both active and full permanently.
        const FULL_RTC               = 1 << 11;
        /// Two-port multiplexer on channel 15.
        const TWO_PORT_MUX           = 1 << 12;
        /// Maintenance channel 17 is populated.
        const MAINTENANCE_CHANNEL    = 1 << 13;
        /// RTC advances from the host microsecond clock.
        const MICROSECOND_CLOCK      = 1 << 14;
        /// PPU relocation register, 28-bit form.
        const RELOCATION_REG_LONG    = 1 << 15;
        /// PPU relocation register, 22-bit form.
        const RELOCATION_REG_SHORT   = 1 << 16;
        /// Central/monitor exchange-jump instructions are disabled.
        const NO_CEJ_MEJ             = 1 << 17;
        /// Per-channel flag register (the PPU SCF/CCF interlock).
        const CHANNEL_FLAG           = 1 << 18;
    }
}

impl Features {
    /// True if either form of the PPU relocation register is present.
    pub fn has_relocation_reg(self) -> bool {
        self.intersects(Features::RELOCATION_REG_LONG | Features::RELOCATION_REG_SHORT)
    }
}

/// Supported mainframe models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Model6400,
    Cyber73,
    Cyber173,
    Cyber175,
    Cyber840A,
    Cyber865,
}

impl ModelType {
    /// Parse the `model` entry.
    pub fn from_name(name: &str) -> Option<ModelType> {
        match name.to_ascii_uppercase().as_str() {
            "6400" => Some(ModelType::Model6400),
            "CYBER73" => Some(ModelType::Cyber73),
            "CYBER173" => Some(ModelType::Cyber173),
            "CYBER175" => Some(ModelType::Cyber175),
            "CYBER840A" => Some(ModelType::Cyber840A),
            "CYBER865" => Some(ModelType::Cyber865),
            _ => None,
        }
    }

    /// Feature word for this model.
    pub fn features(self) -> Features {
        match self {
            ModelType::Model6400 => Features::SERIES_6X00,
            ModelType::Cyber73 => {
                Features::SERIES_70 | Features::INTERLOCK_REG | Features::CMU
            }
            ModelType::Cyber173 => {
                Features::SERIES_170 | Features::STATUS_CONTROL_REG | Features::CMU
            }
            ModelType::Cyber175 => {
                Features::SERIES_170
                    | Features::STATUS_CONTROL_REG
                    | Features::INSTRUCTION_STACK
                    | Features::ISTACK_PREFETCH
                    | Features::FLOAT_175
            }
            ModelType::Cyber840A => {
                Features::SERIES_800
                    | Features::NO_CM_WRAP
                    | Features::FULL_RTC
                    | Features::TWO_PORT_MUX
                    | Features::MAINTENANCE_CHANNEL
                    | Features::CMU
                    | Features::CHANNEL_FLAG
                    | Features::RELOCATION_REG_LONG
                    | Features::MICROSECOND_CLOCK
                    | Features::INSTRUCTION_STACK
                    | Features::ISTACK_PREFETCH
            }
            ModelType::Cyber865 => {
                Features::SERIES_800
                    | Features::NO_CM_WRAP
                    | Features::FULL_RTC
                    | Features::TWO_PORT_MUX
                    | Features::STATUS_CONTROL_REG
                    | Features::RELOCATION_REG_SHORT
                    | Features::MICROSECOND_CLOCK
                    | Features::INSTRUCTION_STACK
                    | Features::ISTACK_PREFETCH
                    | Features::FLOAT_175
            }
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelType::Model6400 => "6400",
            ModelType::Cyber73 => "CYBER73",
            ModelType::Cyber173 => "CYBER173",
            ModelType::Cyber175 => "CYBER175",
            ModelType::Cyber840A => "CYBER840A",
            ModelType::Cyber865 => "CYBER865",
        };
        f.write_str(name)
    }
}

/// NPU connection type for a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Raw,
    Pterm,
    Rs232,
}

impl ConnType {
    fn from_name(name: &str) -> Option<ConnType> {
        match name {
            "raw" => Some(ConnType::Raw),
            "pterm" => Some(ConnType::Pterm),
            "rs232" => Some(ConnType::Rs232),
            _ => None,
        }
    }
}

/// One line of the equipment section.
#[derive(Debug, Clone)]
pub struct EquipmentEntry {
    pub kind: DeviceKind,
    pub eq_no: u8,
    pub unit_no: u8,
    pub channel_no: u8,
    pub device_name: Option<String>,
}

/// One line of the NPU connections section.
#[derive(Debug, Clone)]
pub struct NpuPortEntry {
    pub tcp_port: u16,
    pub max_conns: u16,
    pub conn_type: ConnType,
}

/// Configuration errors are fatal at startup and carry enough context to
/// name the offending section and line.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read profile {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("required section [{0}] not found")]
    MissingSection(String),
    #[error("required entry '{entry}' not found in section [{section}]")]
    MissingEntry { section: String, entry: String },
    #[error("section [{section}], entry '{entry}': {reason}")]
    BadEntry {
        section: String,
        entry: String,
        reason: String,
    },
    #[error("section [{section}], relative line {line}: {reason}")]
    BadLine {
        section: String,
        line: usize,
        reason: String,
    },
}

/// Fully parsed and validated startup profile.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub model: ModelType,
    pub features: Features,
    /// Central memory size in 60-bit words.
    pub memory: u32,
    pub ecs_banks: u32,
    pub esm_banks: u32,
    pub cpus: u8,
    pub mainframes: u8,
    pub cpu_ratio: u32,
    /// Number of PPUs, 10 or 20.
    pub pps: u8,
    /// RTC increment per major cycle; 0 selects host-microsecond pacing.
    pub clock_increment: u32,
    pub deadstart: Vec<u16>,
    pub equipment: Vec<EquipmentEntry>,
    pub npu_connections: Vec<NpuPortEntry>,
    pub persist_dir: Option<PathBuf>,
    pub telnet_port: u16,
    pub trace_mask: u32,
}

impl SystemConfig {
    /// Channel count follows the PPU count: 12 channels for 10 PPUs,
    /// 24 for 20.
    pub fn channel_count(&self) -> u8 {
        if self.pps == 20 {
            0o30
        } else {
            0o14
        }
    }
}

/// Raw sectioned key/value view of a profile file.
///
/// Keys keep first-one-wins semantics within a section; plain (non `=`)
/// lines are collected in order for the deadstart/equipment grammars.
struct ProfileFile {
    sections: BTreeMap<String, Section>,
}

struct Section {
    entries: BTreeMap<String, String>,
    lines: Vec<String>,
}

impl ProfileFile {
    fn parse(text: &str) -> ProfileFile {
        let mut sections = BTreeMap::new();
        let mut current: Option<String> = None;

        for raw in text.lines() {
            // Strip comments and surrounding whitespace.
            let line = match raw.find(';') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_insert_with(|| Section {
                    entries: BTreeMap::new(),
                    lines: Vec::new(),
                });
                current = Some(name);
                continue;
            }

            let section = match &current {
                Some(name) => sections.get_mut(name).expect("section exists"),
                None => continue, // junk before the first section header
            };

            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim().to_string();
                let value = line[eq + 1..].trim().to_string();
                section.entries.entry(key).or_insert(value);
            } else {
                section.lines.push(line.to_string());
            }
        }

        ProfileFile { sections }
    }

    fn section(&self, name: &str) -> Result<&Section, ConfigError> {
        self.sections
            .get(name)
            .ok_or_else(|| ConfigError::MissingSection(name.to_string()))
    }
}

impl Section {
    fn get_str(&self, entry: &str) -> Option<&str> {
        self.entries.get(entry).map(String::as_str)
    }

    fn get_integer(&self, section: &str, entry: &str, default: u32) -> Result<u32, ConfigError> {
        match self.get_str(entry) {
            None => Ok(default),
            Some(text) => text.parse::<u32>().map_err(|_| ConfigError::BadEntry {
                section: section.to_string(),
                entry: entry.to_string(),
                reason: format!("'{}' is not a decimal integer", text),
            }),
        }
    }

    fn get_octal(&self, section: &str, entry: &str, default: u32) -> Result<u32, ConfigError> {
        match self.get_str(entry) {
            None => Ok(default),
            Some(text) => u32::from_str_radix(text, 8).map_err(|_| ConfigError::BadEntry {
                section: section.to_string(),
                entry: entry.to_string(),
                reason: format!("'{}' is not an octal integer", text),
            }),
        }
    }
}

/// Load and validate a profile.
///
/// `config_name` selects the main section, defaulting to `cyber`.
pub fn load(path: &Path, config_name: &str) -> Result<SystemConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, config_name)
}

/// Parse a profile from text. Split from [`load`] so tests can feed
/// profiles without touching the filesystem.
pub fn parse(text: &str, config_name: &str) -> Result<SystemConfig, ConfigError> {
    let file = ProfileFile::parse(text);
    let main = file.section(config_name)?;

    let bad_entry = |entry: &str, reason: String| ConfigError::BadEntry {
        section: config_name.to_string(),
        entry: entry.to_string(),
        reason,
    };

    // Model and feature word.
    let model_name = main.get_str("model").unwrap_or("6400");
    let model = ModelType::from_name(model_name)
        .ok_or_else(|| bad_entry("model", format!("unsupported mainframe '{}'", model_name)))?;
    let mut features = model.features();

    if main.get_integer(config_name, "CEJ/MEJ", 1)? == 0 {
        features |= Features::NO_CEJ_MEJ;
    }

    // Central memory and extended memory banks.
    let memory = main.get_octal(config_name, "memory", 0o1000000)?;
    if memory < MIN_MEMORY || memory > MAX_MEMORY {
        return Err(bad_entry(
            "memory",
            format!("{:o}B outside {:o}B..{:o}B", memory, MIN_MEMORY, MAX_MEMORY),
        ));
    }
    if model == ModelType::Cyber865 && memory % 0o1000000 != 0 {
        return Err(bad_entry(
            "memory",
            "CYBER865 memory must be configured in 262K increments".to_string(),
        ));
    }

    let ecs_banks = main.get_integer(config_name, "ecsbanks", 0)?;
    let esm_banks = main.get_integer(config_name, "esmbanks", 0)?;
    for (entry, banks) in [("ecsbanks", ecs_banks), ("esmbanks", esm_banks)] {
        if !matches!(banks, 0 | 1 | 2 | 4 | 8 | 16) {
            return Err(bad_entry(
                entry,
                format!("{} invalid - correct values are 0, 1, 2, 4, 8 or 16", banks),
            ));
        }
    }
    if ecs_banks != 0 && esm_banks != 0 {
        return Err(bad_entry(
            "esmbanks",
            "cannot configure both ecsbanks and esmbanks".to_string(),
        ));
    }

    // Execution shape.
    let cpus = main.get_integer(config_name, "cpus", 1)?;
    if cpus < 1 || cpus > 2 {
        return Err(bad_entry("cpus", format!("{} is not 1 or 2", cpus)));
    }
    let mainframes = main.get_integer(config_name, "mainframes", 1)?;
    if mainframes < 1 || mainframes > 2 {
        return Err(bad_entry("mainframes", format!("{} is not 1 or 2", mainframes)));
    }

    let cpu_ratio = main.get_integer(config_name, "cpuratio", DEFAULT_CPU_RATIO)?;
    if cpu_ratio < 1 || cpu_ratio > 50 {
        return Err(bad_entry(
            "cpuratio",
            format!("{} outside 1..50", cpu_ratio),
        ));
    }

    let pps = main.get_octal(config_name, "pps", 0o12)?;
    if pps != 0o12 && pps != 0o24 {
        return Err(bad_entry(
            "pps",
            format!("{:o}B unsupported - supported values are 12 or 24", pps),
        ));
    }

    let clock_increment = main.get_integer(config_name, "clock", 0)?;

    // Deadstart panel.
    let ds_name = main
        .get_str("deadstart")
        .ok_or_else(|| ConfigError::MissingEntry {
            section: config_name.to_string(),
            entry: "deadstart".to_string(),
        })?
        .to_string();
    let deadstart = parse_deadstart(file.section(&ds_name)?, &ds_name)?;

    // Equipment list.
    let eq_name = main
        .get_str("equipment")
        .ok_or_else(|| ConfigError::MissingEntry {
            section: config_name.to_string(),
            entry: "equipment".to_string(),
        })?
        .to_string();
    let channel_limit = if pps == 0o24 { 0o30 } else { 0o14 };
    let equipment = parse_equipment(file.section(&eq_name)?, &eq_name, channel_limit)?;

    // Optional NPU connection list.
    let npu_connections = match main.get_str("npuConnections") {
        Some(name) if !name.is_empty() => {
            let name = name.to_string();
            parse_npu_connections(file.section(&name)?, &name)?
        }
        _ => Vec::new(),
    };

    let persist_dir = main
        .get_str("persistDir")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    if let Some(dir) = &persist_dir {
        if !dir.is_dir() {
            return Err(bad_entry(
                "persistDir",
                format!("'{}' is not an existing directory", dir.display()),
            ));
        }
    }

    let telnet_port = main.get_integer(config_name, "telnetport", 5000)? as u16;
    let trace_mask = main.get_octal(config_name, "trace", 0)?;

    info!(
        "profile [{}]: model {} memory {:o}B {} PPUs cpuratio {}",
        config_name, model, memory, pps, cpu_ratio
    );

    Ok(SystemConfig {
        model,
        features,
        memory,
        ecs_banks,
        esm_banks,
        cpus: cpus as u8,
        mainframes: mainframes as u8,
        cpu_ratio,
        pps: if pps == 0o24 { 20 } else { 10 },
        clock_increment,
        deadstart,
        equipment,
        npu_connections,
        persist_dir,
        telnet_port,
        trace_mask,
    })
}

/// Deadstart panel lines are exactly four octal digits each.
fn parse_deadstart(section: &Section, name: &str) -> Result<Vec<u16>, ConfigError> {
    let mut panel = Vec::new();

    for (line_no, line) in section.lines.iter().enumerate() {
        if panel.len() >= MAX_DEADSTART {
            break;
        }
        let token = line.split_whitespace().next().unwrap_or("");
        if token.len() != 4 || !token.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return Err(ConfigError::BadLine {
                section: name.to_string(),
                line: line_no,
                reason: format!("invalid deadstart setting '{}'", token),
            });
        }
        panel.push(u16::from_str_radix(token, 8).expect("validated octal"));
    }

    Ok(panel)
}

/// Equipment lines: `devType,eqNo,unitNo,channelNo[,deviceName]`.
fn parse_equipment(
    section: &Section,
    name: &str,
    channel_limit: u8,
) -> Result<Vec<EquipmentEntry>, ConfigError> {
    let mut entries = Vec::new();

    for (line_no, line) in section.lines.iter().enumerate() {
        let bad = |reason: String| ConfigError::BadLine {
            section: name.to_string(),
            line: line_no,
            reason,
        };

        let mut fields = line.split(',').map(str::trim);

        let kind_name = fields.next().unwrap_or("");
        let kind = DeviceKind::from_mnemonic(kind_name)
            .ok_or_else(|| bad(format!("unknown device '{}'", kind_name)))?;

        let eq_no = fields
            .next()
            .and_then(|t| u8::from_str_radix(t, 8).ok())
            .filter(|&e| e < 0o10)
            .ok_or_else(|| bad("invalid equipment number".to_string()))?;

        let unit_no = fields
            .next()
            .and_then(|t| u8::from_str_radix(t, 8).ok())
            .ok_or_else(|| bad("invalid unit number".to_string()))?;

        // The channel field may carry a trailing device name after a space.
        let channel_field = fields
            .next()
            .ok_or_else(|| bad("missing channel number".to_string()))?;
        let mut channel_parts = channel_field.split_whitespace();
        let channel_no = channel_parts
            .next()
            .and_then(|t| u8::from_str_radix(t, 8).ok())
            .ok_or_else(|| bad("invalid channel number".to_string()))?;
        if channel_no >= channel_limit {
            return Err(bad(format!(
                "channel {:o} not permitted with {:o} channels",
                channel_no, channel_limit
            )));
        }

        let device_name = channel_parts
            .next()
            .map(str::to_string)
            .or_else(|| fields.next().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty());

        entries.push(EquipmentEntry {
            kind,
            eq_no,
            unit_no,
            channel_no,
            device_name,
        });
    }

    Ok(entries)
}

/// NPU connection lines: `tcpPort,maxConns,connType`.
fn parse_npu_connections(
    section: &Section,
    name: &str,
) -> Result<Vec<NpuPortEntry>, ConfigError> {
    let mut entries: Vec<NpuPortEntry> = Vec::new();

    for (line_no, line) in section.lines.iter().enumerate() {
        let bad = |reason: String| ConfigError::BadLine {
            section: name.to_string(),
            line: line_no,
            reason,
        };

        let mut fields = line.split(',').map(str::trim);

        let tcp_port = fields
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| bad("invalid TCP port number".to_string()))?;
        if tcp_port < 1000 || tcp_port > 65535 {
            return Err(bad(format!(
                "TCP port {} outside 1000..65535",
                tcp_port
            )));
        }

        let max_conns = fields
            .next()
            .and_then(|t| t.parse::<u16>().ok())
            .filter(|&c| c <= 100)
            .ok_or_else(|| bad("connection count must be between 0 and 100".to_string()))?;

        let type_name = fields.next().unwrap_or("");
        let conn_type = ConnType::from_name(type_name)
            .ok_or_else(|| bad(format!("unknown NPU connection type '{}'", type_name)))?;

        if entries.iter().any(|e| e.tcp_port == tcp_port as u16) {
            return Err(bad(format!("duplicate TCP port {}", tcp_port)));
        }

        entries.push(NpuPortEntry {
            tcp_port: tcp_port as u16,
            max_conns,
            conn_type,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = "\
; test profile
[cyber]
model=CYBER173
memory=1000000
pps=12
cpuratio=4
deadstart=deadstart.nos
equipment=equipment.nos
npuConnections=npu.nos
trace=17

[deadstart.nos]
0000
1413 ; DCN 13
7113
0001

[equipment.nos]
CO6612,0,0,10
MT669,0,0,13,tape.tap
LP501,5,0,12

[npu.nos]
6610,4,raw
6671,2,pterm
";

    #[test]
    fn test_parse_profile() {
        let cfg = parse(PROFILE, "cyber").unwrap();
        assert_eq!(cfg.model, ModelType::Cyber173);
        assert!(cfg.features.contains(Features::STATUS_CONTROL_REG));
        assert_eq!(cfg.memory, 0o1000000);
        assert_eq!(cfg.pps, 10);
        assert_eq!(cfg.channel_count(), 0o14);
        assert_eq!(cfg.trace_mask, 0o17);
    }

    #[test]
    fn test_parse_deadstart_panel() {
        let cfg = parse(PROFILE, "cyber").unwrap();
        assert_eq!(cfg.deadstart, vec![0o0000, 0o1413, 0o7113, 0o0001]);
    }

    #[test]
    fn test_parse_equipment() {
        let cfg = parse(PROFILE, "cyber").unwrap();
        assert_eq!(cfg.equipment.len(), 3);
        let tape = &cfg.equipment[1];
        assert_eq!(tape.kind, DeviceKind::Mt669);
        assert_eq!(tape.channel_no, 0o13);
        assert_eq!(tape.device_name.as_deref(), Some("tape.tap"));
    }

    #[test]
    fn test_parse_npu_connections() {
        let cfg = parse(PROFILE, "cyber").unwrap();
        assert_eq!(cfg.npu_connections.len(), 2);
        assert_eq!(cfg.npu_connections[0].tcp_port, 6610);
        assert_eq!(cfg.npu_connections[0].conn_type, ConnType::Raw);
    }

    #[test]
    fn test_missing_section_is_fatal() {
        assert!(matches!(
            parse(PROFILE, "nosuch"),
            Err(ConfigError::MissingSection(_))
        ));
    }

    #[test]
    fn test_bad_deadstart_digit_is_fatal() {
        let text = PROFILE.replace("7113", "7193");
        match parse(&text, "cyber") {
            Err(ConfigError::BadLine { section, line, .. }) => {
                assert_eq!(section, "deadstart.nos");
                assert_eq!(line, 2);
            }
            other => panic!("expected BadLine, got {:?}", other),
        }
    }

    #[test]
    fn test_both_bank_kinds_rejected() {
        let text = PROFILE.replace("trace=17", "ecsbanks=4\nesmbanks=2");
        assert!(parse(&text, "cyber").is_err());
    }

    #[test]
    fn test_cpu_ratio_range() {
        let text = PROFILE.replace("cpuratio=4", "cpuratio=99");
        assert!(parse(&text, "cyber").is_err());
    }

    #[test]
    fn test_model_features() {
        assert!(ModelType::Cyber865
            .features()
            .contains(Features::FULL_RTC | Features::MICROSECOND_CLOCK));
        assert!(ModelType::Model6400.features().contains(Features::SERIES_6X00));
        assert!(!ModelType::Model6400.features().contains(Features::CMU));
        assert!(ModelType::Cyber865.features().has_relocation_reg());
    }
}
