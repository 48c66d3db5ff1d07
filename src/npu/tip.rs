//! Terminal Interface Protocol
//!
//! Per-terminal state lives in a Terminal Control Block: the connection
//! state machine, the active parameter set (FN/FV fields negotiated with
//! the host), the upline block sequence number, the input assembly buffer
//! and the output queue. This module also interprets downline blocks
//! addressed to a terminal: initialize handshakes, commands, data, and
//! the terminate/interrupt choreography.

use std::net::TcpStream;
use std::time::Instant;

use log::warn;

use crate::config::ConnType;
use crate::npu::buffer::{NpuBuffer, NpuQueue, MAX_BUFFER};
use crate::npu::{
    block_type, btbsn, Npu, ADDR_HOST, ADDR_NPU, BLK_MASK_BSN, BLK_OFF_BTBSN, BLK_OFF_CN,
    BLK_OFF_P3, BLK_OFF_PFC, BLK_OFF_SFC, BLK_SHIFT_BSN, BT_HT_BACK, BT_HT_BLK, BT_HT_CMD,
    BT_HT_ICMD, BT_HT_ICMR, BT_HT_MSG, BT_HT_NINIT, BT_HT_RINIT, BT_HT_TERM,
};

// ========== Character definitions ==========

pub const CHR_NUL: u8 = 0x00;
pub const CHR_STX: u8 = 0x02;
pub const CHR_EOT: u8 = 0x04;
pub const CHR_BEL: u8 = 0x07;
pub const CHR_BS: u8 = 0x08;
pub const CHR_TAB: u8 = 0x09;
pub const CHR_LF: u8 = 0x0A;
pub const CHR_FF: u8 = 0x0C;
pub const CHR_CR: u8 = 0x0D;
pub const CHR_DC1: u8 = 0x11; // X-ON
pub const CHR_DC3: u8 = 0x13; // X-OFF
pub const CHR_ESC: u8 = 0x1B;
pub const CHR_US: u8 = 0x1F; // end of record
pub const CHR_DEL: u8 = 0x7F;

// ========== TIP types ==========

pub const TT_ASYNC: u8 = 1;

// ========== Data block clarifier bits ==========

pub const DBC_NO_CURSOR_POS: u8 = 0x10;
pub const DBC_NO_FE: u8 = 0x08;
pub const DBC_TRANSPARENT: u8 = 0x04;
pub const DBC_ECHOPLEX_OFF: u8 = 0x02;

// ========== Terminal command function codes ==========

pub const PFC_CTRL: u8 = 0xC1; // terminal characteristics
pub const SFC_DEF: u8 = 0x04; //   define characteristics
pub const SFC_CHAR: u8 = 0x08; //   define multiple characteristics
pub const PFC_RO: u8 = 0xCB; // resume output marker
pub const SFC_MARK: u8 = 0x00;
pub const PFC_BI: u8 = 0xCA; // break indication marker

// ========== FN/FV field names ==========
//
// Values per the NAM host application reference; the undocumented block
// limit fields at the end come from the NDL compiler output.

pub const FN_TD_ABORT_BLOCK: u8 = 0x29;
pub const FN_TD_BLOCK_FACTOR: u8 = 0x19;
pub const FN_TD_BREAK_AS_USER: u8 = 0x33;
pub const FN_TD_BS: u8 = 0x27;
pub const FN_TD_USER_BREAK_1: u8 = 0x2A;
pub const FN_TD_USER_BREAK_2: u8 = 0x2B;
pub const FN_TD_ENA_X_USER_BREAK: u8 = 0x95;
pub const FN_TD_CI: u8 = 0x2C;
pub const FN_TD_CI_AUTO: u8 = 0x2E;
pub const FN_TD_CN: u8 = 0x26;
pub const FN_TD_CURSOR_POS: u8 = 0x47;
pub const FN_TD_CT: u8 = 0x28;
pub const FN_TD_X_CHAR_FLAG: u8 = 0x38;
pub const FN_TD_X_CNT_MSB: u8 = 0x39;
pub const FN_TD_X_CNT_LSB: u8 = 0x3A;
pub const FN_TD_X_CHAR: u8 = 0x3B;
pub const FN_TD_X_TIMEOUT: u8 = 0x3C;
pub const FN_TD_X_MODE_MULTIPLE: u8 = 0x46;
pub const FN_TD_EOB: u8 = 0x40;
pub const FN_TD_EOB_TERM: u8 = 0x41;
pub const FN_TD_EOB_CURSOR_POS: u8 = 0x42;
pub const FN_TD_EOL: u8 = 0x3D;
pub const FN_TD_EOL_TERM: u8 = 0x3E;
pub const FN_TD_EOL_CURSOR_POS: u8 = 0x3F;
pub const FN_TD_ECHOPLEX: u8 = 0x31;
pub const FN_TD_FULL_ASCII: u8 = 0x37;
pub const FN_TD_IN_FLOW_CONTROL: u8 = 0x43;
pub const FN_TD_X_INPUT: u8 = 0x34;
pub const FN_TD_INPUT_DEVICE: u8 = 0x35;
pub const FN_TD_LI: u8 = 0x2D;
pub const FN_TD_LI_AUTO: u8 = 0x2F;
pub const FN_TD_LOCK_KEYBOARD: u8 = 0x20;
pub const FN_TD_OUT_FLOW_CONTROL: u8 = 0x44;
pub const FN_TD_OUTPUT_DEVICE: u8 = 0x36;
pub const FN_TD_PARITY: u8 = 0x32;
pub const FN_TD_PG: u8 = 0x25;
pub const FN_TD_PL: u8 = 0x24;
pub const FN_TD_PW: u8 = 0x23;
pub const FN_TD_SPECIAL_EDIT: u8 = 0x30;
pub const FN_TD_TC: u8 = 0x22;
pub const FN_TD_X_STICKY_TIMEOUT: u8 = 0x92;
pub const FN_TD_X_MODE_DELIMITER: u8 = 0x45;
pub const FN_TD_DUPLEX: u8 = 0x57;
pub const FN_TD_TERM_TRANS_BS_MSB: u8 = 0x1E;
pub const FN_TD_TERM_TRANS_BS_LSB: u8 = 0x1F;
pub const FN_TD_SOLICIT_INPUT: u8 = 0x70;
pub const FN_TD_CI_DELAY: u8 = 0x93;
pub const FN_TD_LI_DELAY: u8 = 0x94;
pub const FN_TD_HOST_NODE: u8 = 0x14;
pub const FN_TD_AUTO_CONNECT: u8 = 0x16;
pub const FN_TD_PRIORITY: u8 = 0x17;
pub const FN_TD_UBL: u8 = 0x18;
pub const FN_TD_ABL: u8 = 0x1A;
pub const FN_TD_DBL: u8 = 0x1B;
pub const FN_TD_DB_SIZE_MSB: u8 = 0x1C;
pub const FN_TD_DB_SIZE_LSB: u8 = 0x1D;
pub const FN_TD_RESTRICTED_RBF: u8 = 0x4D;

/// Terminal connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermConnState {
    Idle,
    NetConnected,
    RequestConfig,
    RequestConnection,
    HostConnected,
    NpuDisconnect,
    HostDisconnect,
}

/// The active terminal parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipParams {
    pub abort_block: u8,
    pub block_factor: u8,
    pub break_as_user: bool,
    pub bs: u8,
    pub user_break_1: u8,
    pub user_break_2: u8,
    pub ena_x_user_break: bool,
    pub ci: u8,
    pub ci_auto: bool,
    pub cn: u8,
    pub cursor_pos: bool,
    pub ct: u8,
    pub x_char_flag: bool,
    pub x_cnt: u16,
    pub x_char: u8,
    pub x_timeout: bool,
    pub x_mode_multiple: bool,
    pub eob: u8,
    pub eob_term: u8,
    pub eob_cursor_pos: u8,
    pub eol: u8,
    pub eol_term: u8,
    pub eol_cursor_pos: u8,
    pub echoplex: bool,
    pub full_ascii: bool,
    pub in_flow_control: bool,
    pub x_input: bool,
    pub input_device: u8,
    pub li: u8,
    pub li_auto: bool,
    pub lock_keyboard: bool,
    pub out_flow_control: bool,
    pub output_device: u8,
    pub parity: u8,
    pub pg: bool,
    pub pl: u8,
    pub pw: u8,
    pub special_edit: bool,
    pub tc: u8,
    pub x_sticky_timeout: bool,
    pub x_mode_delimiter: u8,
    pub duplex: bool,
    pub term_trans_bs: u16,
    pub solicit_input: bool,
    pub ci_delay: u8,
    pub li_delay: u8,
    pub host_node: u8,
    pub auto_connect: bool,
    pub priority: u8,
    pub ubl: u8,
    pub abl: u8,
    pub dbl: u8,
    pub db_size: u16,
    pub restricted_rbf: u8,
}

/// Shared base for the class default tables.
fn default_params(tc: u8) -> TipParams {
    TipParams {
        abort_block: b'X' - 0x40,
        block_factor: 1,
        break_as_user: false,
        bs: CHR_BS,
        user_break_1: b'P' - 0x40,
        user_break_2: b'T' - 0x40,
        ena_x_user_break: false,
        ci: 0,
        ci_auto: false,
        cn: b'X' - 0x40,
        cursor_pos: true,
        ct: CHR_ESC,
        x_char_flag: false,
        x_cnt: 2043,
        x_char: CHR_CR,
        x_timeout: false,
        x_mode_multiple: false,
        eob: CHR_EOT,
        eob_term: 2,
        eob_cursor_pos: 3,
        eol: CHR_CR,
        eol_term: 1,
        eol_cursor_pos: 2,
        echoplex: true,
        full_ascii: false,
        in_flow_control: false,
        x_input: false,
        input_device: 0,
        li: 0,
        li_auto: false,
        lock_keyboard: false,
        out_flow_control: false,
        output_device: 1,
        parity: 2,
        pg: false,
        pl: 24,
        pw: 80,
        special_edit: false,
        tc,
        x_sticky_timeout: false,
        x_mode_delimiter: 0,
        duplex: false,
        term_trans_bs: 1,
        solicit_input: false,
        ci_delay: 0,
        li_delay: 0,
        host_node: 1,
        auto_connect: false,
        priority: 1,
        ubl: 7,
        abl: 2,
        dbl: 2,
        db_size: 940,
        restricted_rbf: 0,
    }
}

/// CDC 713 defaults (terminal class 2).
pub fn default_tc2() -> TipParams {
    default_params(2)
}

/// CDC 721 defaults (terminal class 3).
pub fn default_tc3() -> TipParams {
    default_params(3)
}

/// ANSI X3.64 defaults (terminal class 7): flow control both ways, the
/// network control character moves off ESC.
pub fn default_tc7() -> TipParams {
    TipParams {
        ct: b'%',
        in_flow_control: true,
        out_flow_control: true,
        ..default_params(7)
    }
}

/// Class defaults dispatcher; unknown classes fall back to class 3.
pub fn class_defaults(tc: u8) -> TipParams {
    match tc {
        2 => default_tc2(),
        7 => default_tc7(),
        _ => default_tc3(),
    }
}

/// Terminal Control Block.
pub struct Tcb {
    pub state: TermConnState,
    pub port_number: u8,
    pub conn_type: ConnType,
    pub stream: Option<TcpStream>,

    // Configuration from the CNF/TE reply.
    pub enabled: bool,
    pub term_name: [u8; 7],
    pub tip_type: u8,
    pub sub_tip: u8,
    pub device_type: u8,
    pub code_set: u8,

    pub params: TipParams,

    // Upline input assembly.
    pub upline_bsn: u8,
    pub in_buf: Vec<u8>,
    pub in_buf_start: usize,
    pub x_input_timer: Option<Instant>,

    // Output.
    pub output_q: NpuQueue,
    pub xoff: bool,
    pub dbc_no_echoplex: bool,
    pub dbc_no_cursor_pos: bool,
    pub break_pending: bool,
}

impl Tcb {
    pub fn new(port_number: u8, conn_type: ConnType) -> Tcb {
        let mut tcb = Tcb {
            state: TermConnState::Idle,
            port_number,
            conn_type,
            stream: None,
            enabled: false,
            term_name: [0; 7],
            tip_type: TT_ASYNC,
            sub_tip: 0,
            device_type: 0,
            code_set: 0,
            params: default_tc3(),
            upline_bsn: 0,
            in_buf: Vec::with_capacity(MAX_BUFFER),
            in_buf_start: 0,
            x_input_timer: None,
            output_q: NpuQueue::new(),
            xoff: false,
            dbc_no_echoplex: false,
            dbc_no_cursor_pos: false,
            break_pending: false,
        };
        tcb.input_reset();
        tcb
    }

    /// Rebuild the upline data header and bump the block sequence number
    /// through its 1..7 cycle.
    pub fn input_reset(&mut self) {
        self.upline_bsn += 1;
        if self.upline_bsn == 8 {
            self.upline_bsn = 1;
        }

        self.in_buf.clear();
        self.in_buf.push(ADDR_HOST);
        self.in_buf.push(ADDR_NPU);
        self.in_buf.push(self.port_number);
        self.in_buf.push(btbsn(BT_HT_MSG, self.upline_bsn));
        self.in_buf.push(0); // data block clarifier
        self.in_buf_start = self.in_buf.len();
        self.x_input_timer = None;
    }

    /// Bytes accumulated past the header.
    pub fn input_len(&self) -> usize {
        self.in_buf.len() - self.in_buf_start
    }

    /// Upline block size limit from the blocking factor.
    pub fn block_limit(&self) -> usize {
        (self.params.block_factor as usize).max(1) * 100
    }
}

/// Apply an FN/FV string to a TCB. Unknown field names are logged and
/// skipped. Returns true (the original keeps the same shape to allow a
/// future failure path).
pub fn parse_fn_fv(data: &[u8], tcb: &mut Tcb) -> bool {
    for pair in data.chunks_exact(2) {
        let (fn_code, fv) = (pair[0], pair[1]);
        let p = &mut tcb.params;
        match fn_code {
            FN_TD_ABORT_BLOCK => p.abort_block = fv,
            FN_TD_BLOCK_FACTOR => {
                // Keep the resulting block inside one NPU buffer.
                if fv > 0 && fv <= 20 {
                    p.block_factor = fv;
                }
            }
            FN_TD_BREAK_AS_USER => p.break_as_user = fv != 0,
            FN_TD_BS => p.bs = fv,
            FN_TD_USER_BREAK_1 => p.user_break_1 = fv,
            FN_TD_USER_BREAK_2 => p.user_break_2 = fv,
            FN_TD_ENA_X_USER_BREAK => p.ena_x_user_break = fv != 0,
            FN_TD_CI => p.ci = fv,
            FN_TD_CI_AUTO => p.ci_auto = fv != 0,
            FN_TD_CN => p.cn = fv,
            FN_TD_CURSOR_POS => p.cursor_pos = fv != 0,
            FN_TD_CT => p.ct = fv,
            FN_TD_X_CHAR_FLAG => p.x_char_flag = fv != 0,
            FN_TD_X_CNT_MSB => p.x_cnt = (p.x_cnt & 0x00FF) | ((fv as u16) << 8),
            FN_TD_X_CNT_LSB => p.x_cnt = (p.x_cnt & 0xFF00) | fv as u16,
            FN_TD_X_CHAR => p.x_char = fv,
            FN_TD_X_TIMEOUT => p.x_timeout = fv != 0,
            FN_TD_X_MODE_MULTIPLE => p.x_mode_multiple = fv != 0,
            FN_TD_EOB => p.eob = fv,
            FN_TD_EOB_TERM => p.eob_term = fv,
            FN_TD_EOB_CURSOR_POS => p.eob_cursor_pos = fv,
            FN_TD_EOL => p.eol = fv,
            FN_TD_EOL_TERM => p.eol_term = fv,
            FN_TD_EOL_CURSOR_POS => p.eol_cursor_pos = fv,
            FN_TD_ECHOPLEX => p.echoplex = fv != 0,
            FN_TD_FULL_ASCII => p.full_ascii = fv != 0,
            FN_TD_IN_FLOW_CONTROL => p.in_flow_control = fv != 0,
            FN_TD_X_INPUT => p.x_input = fv != 0,
            FN_TD_INPUT_DEVICE => p.input_device = fv,
            FN_TD_LI => p.li = fv,
            FN_TD_LI_AUTO => p.li_auto = fv != 0,
            FN_TD_LOCK_KEYBOARD => p.lock_keyboard = fv != 0,
            FN_TD_OUT_FLOW_CONTROL => {
                p.out_flow_control = fv != 0;
                if !p.out_flow_control {
                    // Flow control off releases a held terminal.
                    tcb.xoff = false;
                }
            }
            FN_TD_OUTPUT_DEVICE => p.output_device = fv,
            FN_TD_PARITY => p.parity = fv,
            FN_TD_PG => p.pg = fv != 0,
            FN_TD_PL => p.pl = fv,
            FN_TD_PW => p.pw = fv,
            FN_TD_SPECIAL_EDIT => p.special_edit = fv != 0,
            FN_TD_TC => {
                if p.tc != fv {
                    // Class change reloads the class defaults; later
                    // pairs in the same message apply on top of them.
                    tcb.params = class_defaults(fv);
                    tcb.params.tc = fv;
                }
            }
            FN_TD_X_STICKY_TIMEOUT => p.x_sticky_timeout = fv != 0,
            FN_TD_X_MODE_DELIMITER => p.x_mode_delimiter = fv,
            FN_TD_DUPLEX => p.duplex = fv != 0,
            FN_TD_TERM_TRANS_BS_MSB => {
                p.term_trans_bs = (p.term_trans_bs & 0x00FF) | ((fv as u16) << 8)
            }
            FN_TD_TERM_TRANS_BS_LSB => {
                p.term_trans_bs = (p.term_trans_bs & 0xFF00) | fv as u16
            }
            FN_TD_SOLICIT_INPUT => p.solicit_input = fv != 0,
            FN_TD_CI_DELAY => p.ci_delay = fv,
            FN_TD_LI_DELAY => p.li_delay = fv,
            FN_TD_HOST_NODE => p.host_node = fv,
            FN_TD_AUTO_CONNECT => p.auto_connect = fv != 0,
            FN_TD_PRIORITY => p.priority = fv,
            FN_TD_UBL => p.ubl = fv,
            FN_TD_ABL => p.abl = fv,
            FN_TD_DBL => p.dbl = fv,
            FN_TD_DB_SIZE_MSB => p.db_size = (p.db_size & 0x00FF) | ((fv as u16) << 8),
            FN_TD_DB_SIZE_LSB => p.db_size = (p.db_size & 0xFF00) | fv as u16,
            FN_TD_RESTRICTED_RBF => p.restricted_rbf = fv,
            _ => warn!("npu tip: unknown FN/FV {:02X}/{:02X}", fn_code, fv),
        }
    }

    true
}

impl Npu {
    /// Process a downline block addressed to a terminal.
    pub fn tip_process_buffer(&mut self, bp: Box<NpuBuffer>, _priority: u8) {
        let len = bp.content().len();
        if len <= BLK_OFF_BTBSN {
            self.bip.release_buffer(bp);
            return;
        }

        let cn = bp.content()[BLK_OFF_CN];
        if self.tcb(cn).is_none() {
            warn!("npu tip: unexpected connection number {} in downline block", cn);
            self.bip.release_buffer(bp);
            return;
        }

        let btbsn_byte = bp.content()[BLK_OFF_BTBSN];
        let bt = block_type(btbsn_byte);
        let bsn_bits = btbsn_byte & (BLK_MASK_BSN << BLK_SHIFT_BSN);
        let pfc = if len > BLK_OFF_PFC { bp.content()[BLK_OFF_PFC] } else { 0 };
        let sfc = if len > BLK_OFF_SFC { bp.content()[BLK_OFF_SFC] } else { 0 };

        match bt {
            BT_HT_RINIT => {
                // Initialize handshake: acknowledge, respond, and request
                // initialization of our own.
                for bt in [BT_HT_BACK, BT_HT_NINIT, BT_HT_RINIT] {
                    self.bip
                        .request_upline_canned(&[ADDR_HOST, ADDR_NPU, cn, bt]);
                }
                self.bip.release_buffer(bp);
            }
            BT_HT_CMD => {
                if len > BLK_OFF_SFC {
                    if pfc == PFC_CTRL && (sfc == SFC_CHAR || sfc == SFC_DEF) {
                        let data = bp.content()[BLK_OFF_P3.min(len)..].to_vec();
                        let tcb = self.tcb(cn).expect("validated above");
                        parse_fn_fv(&data, tcb);
                    } else if pfc == PFC_RO && sfc == SFC_MARK {
                        // Resume output after a user break.
                        self.tcb(cn).expect("validated above").break_pending = false;
                    }
                }
                // Any command is acknowledged, understood or not.
                self.bip.request_upline_canned(&[
                    ADDR_HOST,
                    ADDR_NPU,
                    cn,
                    BT_HT_BACK | bsn_bits,
                ]);
                self.bip.release_buffer(bp);
            }
            BT_HT_BLK | BT_HT_MSG => {
                let connected =
                    self.tcb(cn).expect("validated above").state == TermConnState::HostConnected;
                if connected {
                    let last = bt == BT_HT_MSG;
                    self.async_process_downline_data(cn, bp, last);
                } else {
                    // Race while disconnecting: acknowledge but discard.
                    self.bip.request_upline_canned(&[
                        ADDR_HOST,
                        ADDR_NPU,
                        cn,
                        BT_HT_BACK | bsn_bits,
                    ]);
                    self.bip.release_buffer(bp);
                }
            }
            BT_HT_BACK => {
                self.bip.release_buffer(bp);
            }
            BT_HT_TERM => {
                let state = self.tcb(cn).expect("validated above").state;
                match state {
                    TermConnState::HostDisconnect => {
                        // Host echoed our TERM: finish with TCN/TA/N and
                        // drop the network side.
                        self.svm_disc_reply_terminal(cn);
                        self.net_disconnected(cn);
                    }
                    TermConnState::NpuDisconnect => {
                        // Echo the TERM block.
                        self.bip
                            .request_upline_canned(&[ADDR_HOST, ADDR_NPU, cn, BT_HT_TERM]);
                    }
                    _ => warn!("npu tip: unexpected TERM block on connection {}", cn),
                }
                self.bip.release_buffer(bp);
            }
            BT_HT_ICMD => {
                // Interrupt: discard queued output, acknowledge.
                self.tcb(cn).expect("validated above").xoff = false;
                self.tip_discard_output_q(cn);
                self.bip.request_upline_canned(&[
                    ADDR_HOST,
                    ADDR_NPU,
                    cn,
                    BT_HT_ICMR | bsn_bits,
                ]);
                self.bip.release_buffer(bp);
            }
            BT_HT_ICMR => {
                self.bip.release_buffer(bp);
            }
            _ => {
                warn!("npu tip: unhandled block type {:X} on connection {}", bt, cn);
                self.bip.release_buffer(bp);
            }
        }
    }

    /// Host-initiated terminate: flush output and send the initial TERM
    /// block, which the host echoes back.
    pub fn tip_terminate_connection(&mut self, cn: u8) {
        if let Some(tcb) = self.tcb(cn) {
            tcb.xoff = false;
        }
        self.tip_discard_output_q(cn);
        if let Some(tcb) = self.tcb(cn) {
            tcb.state = TermConnState::HostDisconnect;
        }
        self.bip
            .request_upline_canned(&[ADDR_HOST, ADDR_NPU, cn, BT_HT_TERM]);
    }

    /// Send user break 1 or 2 upline: an interrupt command followed by a
    /// break-indication marker, with output purged.
    pub fn tip_send_user_break(&mut self, cn: u8, bt: u8) {
        let (port, bsn, pending) = match self.tcb(cn) {
            Some(tcb) => (tcb.port_number, tcb.upline_bsn, tcb.break_pending),
            None => return,
        };
        if pending {
            return;
        }

        if let Some(tcb) = self.tcb(cn) {
            tcb.break_pending = true;
        }

        self.bip.request_upline_canned(&[
            ADDR_HOST,
            ADDR_NPU,
            port,
            btbsn(BT_HT_ICMD, bsn),
            (1 << (bt - 1)) + 2,
        ]);

        let bsn = {
            let tcb = self.tcb(cn).expect("checked above");
            tcb.upline_bsn += 1;
            if tcb.upline_bsn == 8 {
                tcb.upline_bsn = 1;
            }
            tcb.upline_bsn
        };

        self.bip.request_upline_canned(&[
            ADDR_HOST,
            ADDR_NPU,
            port,
            btbsn(BT_HT_CMD, bsn),
            PFC_BI,
            SFC_MARK,
        ]);

        self.tip_discard_output_q(cn);
        if let Some(tcb) = self.tcb(cn) {
            tcb.input_reset();
        }
    }

    /// Drop the pending output queue, acknowledging every block that
    /// carried a sequence number.
    pub fn tip_discard_output_q(&mut self, cn: u8) {
        if cn == 0 || cn as usize > self.tcbs.len() {
            return;
        }
        let tcb = &mut self.tcbs[cn as usize - 1];
        let port = tcb.port_number;
        while let Some(bp) = tcb.output_q.extract() {
            if bp.block_seq_no != 0 {
                let ack = [
                    ADDR_HOST,
                    ADDR_NPU,
                    port,
                    BT_HT_BACK | (bp.block_seq_no << BLK_SHIFT_BSN),
                ];
                self.bip.request_upline_canned(&ack);
            }
            self.bip.release_buffer(bp);
        }
    }

    /// Acknowledge a block the network has fully transmitted.
    pub fn tip_notify_sent(&mut self, cn: u8, block_seq_no: u8) {
        self.bip.request_upline_canned(&[
            ADDR_HOST,
            ADDR_NPU,
            cn,
            BT_HT_BACK | (block_seq_no << BLK_SHIFT_BSN),
        ]);
    }
}
