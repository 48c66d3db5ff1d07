//! Network Processing Unit
//!
//! An in-process simulation of the communications front end: a 2550-class
//! processor that terminals dial into over TCP. It exchanges blocks with
//! the mainframe over its host channel and runs three protocol layers:
//!
//! - `bip`: Block Interface Protocol - buffer pool and block movement
//! - `svm`: Service Messages - supervision and connection orchestration
//! - `tip`: Terminal Interface Protocol - per-terminal state and
//!   parameters, with the async data path in `async_tip`
//! - `net`: the TCP listener thread and the non-blocking data poll
//! - `hip`: the host channel device
//!
//! Block format: every block starts with a 4-byte header (destination
//! node, source node, connection number, block type / sequence number /
//! priority). Service messages follow with a PFC/SFC pair. The block
//! sequence number cycles 1..7; 0 is reserved.

pub mod async_tip;
pub mod bip;
pub mod buffer;
pub mod hip;
pub mod net;
pub mod svm;
pub mod tip;

use crate::config::{ConnType, NpuPortEntry};

use bip::Bip;
use net::Net;
use svm::{Svm, SvmState};
use tip::Tcb;

// ========== Block offsets ==========

pub const BLK_OFF_DN: usize = 0;
pub const BLK_OFF_SN: usize = 1;
pub const BLK_OFF_CN: usize = 2;
pub const BLK_OFF_BTBSN: usize = 3;
pub const BLK_OFF_DATA: usize = 4;
pub const BLK_OFF_DBC: usize = 4;
pub const BLK_OFF_PFC: usize = 4;
pub const BLK_OFF_SFC: usize = 5;
pub const BLK_OFF_P3: usize = 6;
pub const BLK_OFF_P4: usize = 7;

pub const BLK_SHIFT_BSN: u8 = 4;
pub const BLK_MASK_BT: u8 = 0x0F;
pub const BLK_MASK_BSN: u8 = 0x07;

// ========== Block types ==========

pub const BT_HT_BLK: u8 = 0x1; // block
pub const BT_HT_MSG: u8 = 0x2; // message (last block)
pub const BT_HT_BACK: u8 = 0x3; // acknowledgement
pub const BT_HT_CMD: u8 = 0x4; // command
pub const BT_HT_BREAK: u8 = 0x5; // break
pub const BT_HT_QBLK: u8 = 0x6; // qualified block
pub const BT_HT_QMSG: u8 = 0x7; // qualified message
pub const BT_HT_RESET: u8 = 0x8; // reset
pub const BT_HT_RINIT: u8 = 0x9; // request initialize
pub const BT_HT_NINIT: u8 = 0xA; // initialize response
pub const BT_HT_TERM: u8 = 0xB; // terminate
pub const BT_HT_ICMD: u8 = 0xC; // interrupt command
pub const BT_HT_ICMR: u8 = 0xD; // interrupt command response

// ========== Service message function codes ==========
//
// Both ends of the service-message exchange live inside the emulated
// system, so the numeric values only need to be self-consistent; the
// mnemonics follow the CCP documentation.

pub const PFC_REG: u8 = 0x01; // link regulation
pub const SFC_LL: u8 = 0x00; //   logical link

pub const PFC_SUP: u8 = 0x02; // supervision
pub const SFC_IN: u8 = 0x00; //   initiate

pub const PFC_NPS: u8 = 0x03; // NPU status
pub const SFC_NP: u8 = 0x00;

pub const PFC_CNF: u8 = 0x04; // configure terminal
pub const SFC_TE: u8 = 0x01;

pub const PFC_ICN: u8 = 0x05; // initiate connection

pub const PFC_TCN: u8 = 0x06; // terminate connection
pub const SFC_TA: u8 = 0x02;

/// Secondary function flag bits.
pub const SFC_RESP: u8 = 1 << 6; // normal response
pub const SFC_ERR: u8 = 2 << 6; // abnormal response

// ========== Regulation level bits ==========

pub const REG_LVL_CS_AVAILABLE: u8 = 0x04;
pub const REG_LVL_NS_AVAILABLE: u8 = 0x08;

// ========== Node addresses ==========
//
// The coupler node and NPU node addresses from the network definition.

pub const ADDR_HOST: u8 = 1;
pub const ADDR_NPU: u8 = 2;

/// The whole NPU: protocol layer state plus the terminal control blocks.
pub struct Npu {
    pub bip: Bip,
    pub svm: Svm,
    pub tcbs: Vec<Tcb>,
    pub net: Net,
}

impl Npu {
    /// Build an NPU for the configured listening ports. Each port
    /// contributes `max_conns` terminal control blocks.
    pub fn new(ports: &[NpuPortEntry]) -> Npu {
        let mut tcbs = Vec::new();
        for port in ports {
            for _ in 0..port.max_conns {
                let port_number = tcbs.len() as u8 + 1;
                tcbs.push(Tcb::new(port_number, port.conn_type));
            }
        }
        Npu {
            bip: Bip::new(),
            svm: Svm::new(),
            tcbs,
            net: Net::new(ports),
        }
    }

    /// Default configuration: the classic raw port with ten connections.
    pub fn with_default_port(base_port: u16) -> Npu {
        Npu::new(&[NpuPortEntry {
            tcp_port: base_port,
            max_conns: 10,
            conn_type: ConnType::Raw,
        }])
    }

    /// True once the host has agreed to supervise us.
    pub fn is_ready(&self) -> bool {
        self.svm.state == SvmState::Ready
    }

    /// Terminal control block for a connection number (1-based).
    pub(crate) fn tcb(&mut self, cn: u8) -> Option<&mut Tcb> {
        if cn == 0 {
            return None;
        }
        self.tcbs.get_mut(cn as usize - 1)
    }
}

/// Compose the BT/BSN/priority byte.
pub fn btbsn(bt: u8, bsn: u8) -> u8 {
    (bt & BLK_MASK_BT) | ((bsn & BLK_MASK_BSN) << BLK_SHIFT_BSN)
}

/// Split a BT/BSN/priority byte.
pub fn block_type(b: u8) -> u8 {
    b & BLK_MASK_BT
}

pub fn block_seq_no(b: u8) -> u8 {
    (b >> BLK_SHIFT_BSN) & BLK_MASK_BSN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btbsn_round_trip() {
        let b = btbsn(BT_HT_MSG, 5);
        assert_eq!(block_type(b), BT_HT_MSG);
        assert_eq!(block_seq_no(b), 5);
    }

    #[test]
    fn test_npu_tcb_lookup() {
        let mut npu = Npu::with_default_port(6610);
        assert_eq!(npu.tcbs.len(), 10);
        assert!(npu.tcb(0).is_none());
        assert_eq!(npu.tcb(1).unwrap().port_number, 1);
        assert!(npu.tcb(11).is_none());
    }
}
