//! Service Message layer
//!
//! SVM negotiates supervision with the host and orchestrates terminal
//! connect and disconnect sequences. Until the host answers our
//! request-supervision message, no terminal connection is attempted.
//!
//! Connect sequence per port: network connect, then CNF/TE (configure
//! terminal) upline, then ICN/TE (initiate connection) upline, then the
//! terminal is host-connected. Disconnects run the TCN/TA exchange in
//! either direction.

use log::warn;

use crate::npu::buffer::NpuBuffer;
use crate::npu::tip::{class_defaults, parse_fn_fv, TermConnState};
use crate::npu::{
    Npu, ADDR_HOST, ADDR_NPU, BLK_OFF_BTBSN, BLK_OFF_CN, BLK_OFF_P3, BLK_OFF_P4, BLK_OFF_PFC,
    BLK_OFF_SFC, BT_HT_CMD, PFC_CNF, PFC_ICN, PFC_NPS, PFC_REG, PFC_SUP, PFC_TCN,
    REG_LVL_CS_AVAILABLE, SFC_ERR, SFC_IN, SFC_LL, SFC_NP, SFC_RESP, SFC_TA, SFC_TE,
};

/// Supervision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmState {
    Idle,
    WaitSupervision,
    Ready,
}

pub struct Svm {
    pub state: SvmState,
    old_reg_level: u8,
}

impl Svm {
    pub fn new() -> Svm {
        Svm {
            state: SvmState::Idle,
            old_reg_level: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = SvmState::Idle;
        self.old_reg_level = 0;
    }
}

impl Default for Svm {
    fn default() -> Self {
        Self::new()
    }
}

impl Npu {
    /// Host regulation order. A level change is reported on the logical
    /// link; the first sight of an available CS triggers the
    /// request-supervision handshake.
    pub fn svm_notify_host_regulation(&mut self, reg_level: u8) {
        if self.svm.state == SvmState::Idle || reg_level != self.svm.old_reg_level {
            self.svm.old_reg_level = reg_level;
            let link_regulation = [
                ADDR_HOST,
                ADDR_NPU,
                0,
                BT_HT_CMD,
                PFC_REG,
                SFC_LL,
                reg_level,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
            ];
            self.bip.request_upline_canned(&link_regulation);
        }

        if self.svm.state == SvmState::Idle && reg_level & REG_LVL_CS_AVAILABLE != 0 {
            let request_supervision = [
                ADDR_HOST,
                ADDR_NPU,
                0,
                BT_HT_CMD,
                PFC_SUP,
                SFC_IN,
                0, // PS
                0, // PL
                0, // RI
                0,
                0,
                0,
                3, // CCP version
                1,
                0, // CCP level
                0,
                0, // CCP cycle
                0,
                0,
                0,
                0,
            ];
            self.bip.request_upline_canned(&request_supervision);
            self.svm.state = SvmState::WaitSupervision;
        }
    }

    /// Start the host connection sequence for a network-connected port.
    pub fn svm_connect_terminal(&mut self, cn: u8) -> bool {
        if self.svm_request_terminal_config(cn) {
            if let Some(tcb) = self.tcb(cn) {
                tcb.state = TermConnState::RequestConfig;
            }
            true
        } else {
            false
        }
    }

    /// Process a downline service message.
    pub fn svm_process_buffer(&mut self, bp: Box<NpuBuffer>) {
        let len = bp.content().len();

        if len < BLK_OFF_SFC + 1 {
            if len == BLK_OFF_BTBSN + 1 && bp.content()[BLK_OFF_CN] != 0 {
                // NAM sends input acknowledgements as service messages;
                // the TIP knows what to do with them.
                self.tip_process_buffer(bp, 0);
                return;
            }
            warn!("npu svm: short service message in state {:?}", self.svm.state);
            self.bip.release_buffer(bp);
            return;
        }

        // Service messages address connection 0; the real connection
        // number rides in P3 for the messages that carry one.
        if bp.content()[BLK_OFF_CN] != 0 {
            warn!(
                "npu svm: connection number {} must be zero in service messages",
                bp.content()[BLK_OFF_CN]
            );
            self.bip.release_buffer(bp);
            return;
        }

        let pfc = bp.content()[BLK_OFF_PFC];
        let sfc = bp.content()[BLK_OFF_SFC];

        // Messages that carry a port number in P3.
        let cn = if matches!(pfc, PFC_CNF | PFC_ICN | PFC_TCN) {
            if len < BLK_OFF_P3 + 1 {
                warn!("npu svm: message {:02X}/{:02X} has no P3", pfc, sfc);
                self.bip.release_buffer(bp);
                return;
            }
            let cn = bp.content()[BLK_OFF_P3];
            if cn == 0 || cn as usize > self.tcbs.len() {
                warn!(
                    "npu svm: unexpected port number {} in message {:02X}/{:02X}",
                    cn, pfc, sfc
                );
                self.bip.release_buffer(bp);
                return;
            }
            cn
        } else {
            0
        };

        match pfc {
            PFC_SUP => {
                if sfc == SFC_IN | SFC_RESP {
                    if self.svm.state != SvmState::WaitSupervision {
                        warn!(
                            "npu svm: unexpected supervision reply in state {:?}",
                            self.svm.state
                        );
                    } else {
                        // The host agreed to supervise us; terminals may
                        // now connect.
                        self.svm.state = SvmState::Ready;
                    }
                } else {
                    warn!("npu svm: unexpected message {:02X}/{:02X}", pfc, sfc);
                }
            }
            PFC_NPS => {
                if sfc == SFC_NP {
                    self.bip.request_upline_canned(&[
                        ADDR_HOST,
                        ADDR_NPU,
                        0,
                        BT_HT_CMD,
                        PFC_NPS,
                        SFC_NP | SFC_RESP,
                    ]);
                } else {
                    warn!("npu svm: unexpected message {:02X}/{:02X}", pfc, sfc);
                }
            }
            PFC_CNF => {
                let state = self.tcb(cn).map(|t| t.state);
                if state != Some(TermConnState::RequestConfig) {
                    warn!("npu svm: unexpected configuration reply in state {:?}", state);
                } else if sfc == SFC_TE | SFC_RESP {
                    let configured = self.svm_process_terminal_config(cn, &bp);
                    if configured && self.svm_request_terminal_connection(cn) {
                        if let Some(tcb) = self.tcb(cn) {
                            tcb.state = TermConnState::RequestConnection;
                        }
                    } else {
                        self.net_disconnected(cn);
                    }
                } else if sfc == SFC_TE | SFC_ERR {
                    warn!("npu svm: terminal on port {} not configured", cn);
                    self.net_disconnected(cn);
                } else {
                    warn!("npu svm: unexpected message {:02X}/{:02X} with CN {}", pfc, sfc, cn);
                    self.net_disconnected(cn);
                }
            }
            PFC_ICN => {
                let state = self.tcb(cn).map(|t| t.state);
                if state != Some(TermConnState::RequestConnection) {
                    warn!("npu svm: unexpected connection reply in state {:?}", state);
                } else if sfc == SFC_TE | SFC_RESP {
                    self.net_connected(cn);
                } else if sfc == SFC_TE | SFC_ERR {
                    let reason = bp.content().get(BLK_OFF_P4).copied().unwrap_or(0);
                    warn!("npu svm: terminal connection rejected - reason {:#04X}", reason);
                    self.net_disconnected(cn);
                } else {
                    warn!("npu svm: unexpected message {:02X}/{:02X} with CN {}", pfc, sfc, cn);
                    self.net_disconnected(cn);
                }
            }
            PFC_TCN => {
                if sfc == SFC_TA {
                    // Host tears the connection down.
                    self.tip_terminate_connection(cn);
                } else if sfc == SFC_TA | SFC_RESP {
                    if self.tcb(cn).map(|t| t.state) == Some(TermConnState::NpuDisconnect) {
                        if let Some(tcb) = self.tcb(cn) {
                            tcb.state = TermConnState::Idle;
                        }
                    }
                } else {
                    warn!("npu svm: unexpected message {:02X}/{:02X} with CN {}", pfc, sfc, cn);
                }
            }
            _ => {
                warn!(
                    "npu svm: unexpected service message {:02X}/{:02X} in state {:?}",
                    pfc, sfc, self.svm.state
                );
            }
        }

        self.bip.release_buffer(bp);
    }

    /// Our side noticed the network connection died: clean up and send
    /// TCN/TA/R so the host releases the port.
    pub fn svm_disc_request_terminal(&mut self, cn: u8) {
        let state = match self.tcb(cn) {
            Some(tcb) => tcb.state,
            None => return,
        };
        if state == TermConnState::HostConnected {
            if let Some(tcb) = self.tcb(cn) {
                tcb.xoff = false;
            }
            self.tip_discard_output_q(cn);
            if let Some(tcb) = self.tcb(cn) {
                tcb.state = TermConnState::NpuDisconnect;
            }
            self.bip.request_upline_canned(&[
                ADDR_HOST,
                ADDR_NPU,
                0,
                BT_HT_CMD,
                PFC_TCN,
                SFC_TA,
                cn,
            ]);
        } else if let Some(tcb) = self.tcb(cn) {
            tcb.state = TermConnState::Idle;
        }
    }

    /// Answer a host-initiated terminate with TCN/TA/N.
    pub fn svm_disc_reply_terminal(&mut self, cn: u8) {
        self.bip.request_upline_canned(&[
            ADDR_HOST,
            ADDR_NPU,
            0,
            BT_HT_CMD,
            PFC_TCN,
            SFC_TA | SFC_RESP,
            cn,
        ]);
    }

    /// Send the terminal configuration request (CNF/TE) upline.
    fn svm_request_terminal_config(&mut self, cn: u8) -> bool {
        let (port, tip_type) = match self.tcb(cn) {
            Some(tcb) => (tcb.port_number, tcb.tip_type),
            None => return false,
        };
        let mut bp = match self.bip.get_buffer() {
            Some(bp) => bp,
            None => return false,
        };

        bp.fill(&[
            ADDR_HOST,
            ADDR_NPU,
            0,
            BT_HT_CMD,
            PFC_CNF,
            SFC_TE,
            port,              // port from the network definition
            0,                 // sub-port, always 0 for async
            tip_type << 3,     // no auto-recognition; TIP type; subtype 0
        ]);
        self.bip.request_upline_transfer(bp);
        true
    }

    /// Digest the configuration reply into the TCB.
    fn svm_process_terminal_config(&mut self, cn: u8, bp: &NpuBuffer) -> bool {
        let block = bp.content();
        // P3 onward: port, sub-port, two address bytes, device type,
        // sub-TIP, 7-char terminal name, class, status, last response,
        // code set, then the FN/FV string.
        let fixed_len = BLK_OFF_P3 + 6 + 7 + 4;
        if block.len() < fixed_len {
            warn!(
                "npu svm: short terminal configuration response with length {}",
                block.len()
            );
            return false;
        }

        let mut at = BLK_OFF_P3 + 4;
        let device_type = block[at];
        let sub_tip = block[at + 1];
        at += 2;
        let mut term_name = [0u8; 7];
        term_name.copy_from_slice(&block[at..at + 7]);
        at += 7;
        let term_class = block[at];
        let status = block[at + 1];
        let code_set = block[at + 3];
        at += 4;
        let fn_fv = block[at..].to_vec();

        let tcb = self.tcb(cn).expect("caller validated");
        tcb.params = class_defaults(term_class);
        parse_fn_fv(&fn_fv, tcb);

        tcb.enabled = status == 0;
        tcb.term_name = term_name;
        tcb.device_type = device_type;
        tcb.sub_tip = sub_tip;
        tcb.code_set = code_set;
        tcb.params.tc = term_class;
        tcb.break_pending = false;
        true
    }

    /// Send the terminal connection request (ICN/TE) upline.
    fn svm_request_terminal_connection(&mut self, cn: u8) -> bool {
        let (port, params, device_type, term_name) = match self.tcb(cn) {
            Some(tcb) => (
                tcb.port_number,
                tcb.params.clone(),
                tcb.device_type,
                tcb.term_name,
            ),
            None => return false,
        };
        let mut bp = match self.bip.get_buffer() {
            Some(bp) => bp,
            None => return false,
        };

        let mut msg = vec![
            ADDR_HOST,
            ADDR_NPU,
            0,
            BT_HT_CMD,
            PFC_ICN,
            SFC_TE,
            port,           // CN
            params.tc,      // terminal class
            params.pl,      // page length
            params.pw,      // page width
            device_type,    // device type
            3,              // downline block limit
        ];
        msg.extend_from_slice(&term_name);
        msg.extend_from_slice(&[
            3,    // application block limit
            0x07, // application block size
            0x00,
            0, // auto login flag
            0, // device ordinal
            0x07, // transmission block size
            0x00,
            0, // sub device type
        ]);
        msg.extend_from_slice(&term_name); // owning console
        msg.extend_from_slice(&[
            7,               // security level
            params.priority, // priority
            1,               // interactive capability
            1,               // echoplex
            100,             // upline block size
            1,               // hardwired flag
            0,               // VTP
            0,               // DTE address length
        ]);

        bp.fill(&msg);
        self.bip.request_upline_transfer(bp);
        true
    }
}
