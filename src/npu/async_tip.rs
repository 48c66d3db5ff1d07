//! Async terminal data path
//!
//! Upline, keyboard input accumulates in the TCB's assembly buffer behind
//! the prebuilt block header. A block goes upline when the size limit is
//! reached, when a block delimiter arrives, or - in transparent input
//! mode - when the per-port timer expires. Downline, data blocks are
//! translated (format effectors, data block clarifier) and queued for the
//! socket.

use std::time::Duration;

use crate::npu::buffer::NpuBuffer;
use crate::npu::tip::{
    TermConnState, CHR_CR, CHR_DC1, CHR_DC3, CHR_LF, DBC_ECHOPLEX_OFF, DBC_NO_CURSOR_POS,
    DBC_NO_FE, DBC_TRANSPARENT,
};
use crate::npu::{
    block_seq_no, btbsn, Npu, BLK_OFF_BTBSN, BLK_OFF_DATA, BLK_OFF_DBC, BT_HT_BLK, BT_HT_MSG,
};

/// Transparent-input flush timer.
pub const X_INPUT_TIMEOUT: Duration = Duration::from_millis(200);

impl Npu {
    /// Process bytes read from a terminal's socket.
    pub fn async_process_upline_data(&mut self, cn: u8, data: &[u8]) {
        for &byte in data {
            self.async_process_upline_byte(cn, byte);
        }
    }

    fn async_process_upline_byte(&mut self, cn: u8, byte: u8) {
        let params = match self.tcb(cn) {
            Some(tcb) => tcb.params.clone(),
            None => return,
        };

        if params.x_input {
            // Transparent input: nothing is interpreted except the
            // optional delimiter; the timer flushes stragglers.
            let (flush, timer_start) = {
                let tcb = self.tcb(cn).expect("checked above");
                tcb.in_buf.push(byte);
                let full = tcb.input_len() >= params.x_cnt as usize
                    || tcb.input_len() >= tcb.block_limit();
                let delimited = params.x_char_flag && byte == params.x_char;
                (full || delimited, tcb.x_input_timer.is_none())
            };
            if flush {
                self.async_flush_upline(cn, true);
            } else if timer_start && params.x_timeout {
                if let Some(tcb) = self.tcb(cn) {
                    tcb.x_input_timer = Some(std::time::Instant::now());
                }
            }
            return;
        }

        // Terminal-side flow control for our output.
        if params.out_flow_control {
            if byte == CHR_DC3 {
                if let Some(tcb) = self.tcb(cn) {
                    tcb.xoff = true;
                }
                return;
            }
            if byte == CHR_DC1 {
                if let Some(tcb) = self.tcb(cn) {
                    tcb.xoff = false;
                }
                self.net_try_output(cn);
                return;
            }
        }

        // User breaks interrupt everything else.
        if byte == params.user_break_1 {
            self.tip_send_user_break(cn, 1);
            return;
        }
        if byte == params.user_break_2 {
            self.tip_send_user_break(cn, 2);
            return;
        }

        if byte == params.bs {
            // Rub out the previous character.
            let echo = {
                let tcb = self.tcb(cn).expect("checked above");
                if tcb.input_len() > 0 {
                    tcb.in_buf.pop();
                    true
                } else {
                    false
                }
            };
            if echo && params.echoplex {
                self.async_echo(cn, &[params.bs, b' ', params.bs]);
            }
            return;
        }

        if byte == params.cn {
            // Cancel: discard the line under assembly.
            if let Some(tcb) = self.tcb(cn) {
                let start = tcb.in_buf_start;
                tcb.in_buf.truncate(start);
            }
            if params.echoplex {
                self.async_echo(cn, b"*DEL*\r\n");
            }
            return;
        }

        if byte == params.eol {
            if params.echoplex {
                self.async_echo(cn, &[CHR_CR, CHR_LF]);
            }
            self.async_flush_upline(cn, true);
            return;
        }

        if byte == params.eob {
            self.async_flush_upline(cn, true);
            return;
        }

        // Ordinary data byte.
        let flush = {
            let tcb = self.tcb(cn).expect("checked above");
            tcb.in_buf.push(byte);
            tcb.input_len() >= tcb.block_limit()
        };
        let no_echo = self.tcb(cn).map(|t| t.dbc_no_echoplex).unwrap_or(false);
        if params.echoplex && !no_echo {
            self.async_echo(cn, &[byte]);
        }
        if flush {
            // Size limit reached: this block is not the last of the
            // message.
            self.async_flush_upline(cn, false);
        }
    }

    /// Flush transparent-input buffers whose timers have expired.
    pub(crate) fn async_check_input_timers(&mut self) {
        for index in 0..self.tcbs.len() {
            let expired = {
                let tcb = &self.tcbs[index];
                tcb.state == TermConnState::HostConnected
                    && tcb.params.x_input
                    && tcb.params.x_timeout
                    && tcb.input_len() > 0
                    && tcb
                        .x_input_timer
                        .map(|t| t.elapsed() >= X_INPUT_TIMEOUT)
                        .unwrap_or(false)
            };
            if expired {
                self.async_flush_upline((index + 1) as u8, true);
            }
        }
    }

    /// Send the assembled input block upline and rebuild the header.
    fn async_flush_upline(&mut self, cn: u8, last: bool) {
        let block = {
            let tcb = match self.tcb(cn) {
                Some(tcb) => tcb,
                None => return,
            };
            if tcb.state != TermConnState::HostConnected {
                tcb.input_reset();
                return;
            }
            let mut block = tcb.in_buf.clone();
            // BLK marks a continued message, MSG the final block.
            let bt = if last { BT_HT_MSG } else { BT_HT_BLK };
            block[BLK_OFF_BTBSN] = btbsn(bt, tcb.upline_bsn);
            tcb.input_reset();
            block
        };

        match self.bip.get_buffer() {
            Some(mut bp) => {
                bp.fill(&block);
                self.bip.request_upline_transfer(bp);
            }
            None => {
                // Out of buffers: the input is lost; the terminal user
                // sees no echo of the block going through and retries.
            }
        }
    }

    fn async_echo(&mut self, cn: u8, data: &[u8]) {
        self.net_send(cn, data);
    }

    /// Translate and queue a downline data block for a terminal.
    pub fn async_process_downline_data(&mut self, cn: u8, bp: Box<NpuBuffer>, _last: bool) {
        let content = bp.content();
        let bsn = block_seq_no(content[BLK_OFF_BTBSN]);

        if content.len() <= BLK_OFF_DBC {
            // Header-only block: acknowledge and move on.
            self.bip.release_buffer(bp);
            if bsn != 0 {
                self.tip_notify_sent(cn, bsn);
            }
            return;
        }

        let dbc = content[BLK_OFF_DBC];
        if let Some(tcb) = self.tcb(cn) {
            tcb.dbc_no_echoplex = dbc & DBC_ECHOPLEX_OFF != 0;
            tcb.dbc_no_cursor_pos = dbc & DBC_NO_CURSOR_POS != 0;
        }

        let payload = &content[BLK_OFF_DATA + 1..];
        let mut out = Vec::with_capacity(payload.len() + 4);

        if dbc & DBC_TRANSPARENT != 0 {
            out.extend_from_slice(payload);
        } else {
            let mut rest = payload;
            if dbc & DBC_NO_FE == 0 && !payload.is_empty() {
                // The first character is a format effector.
                match payload[0] {
                    b' ' => out.extend_from_slice(b"\r\n"),
                    b'0' => out.extend_from_slice(b"\r\n\n"),
                    b'1' => out.extend_from_slice(b"\r\n\x0c"),
                    b'+' => out.push(b'\r'),
                    b'*' => {} // no motion
                    _ => out.extend_from_slice(b"\r\n"),
                }
                rest = &payload[1..];
            }
            out.extend_from_slice(rest);
        }

        self.bip.release_buffer(bp);
        self.net_queue_output(cn, &out, bsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npu::tip::{FN_TD_X_INPUT, FN_TD_X_TIMEOUT};
    use crate::npu::{block_type, ADDR_HOST, ADDR_NPU, BLK_OFF_CN};

    fn connected_npu() -> Npu {
        let mut npu = Npu::with_default_port(6610);
        npu.tcbs[0].state = TermConnState::HostConnected;
        npu.tcbs[0].params.echoplex = false; // no socket in these tests
        npu
    }

    fn upline_blocks(npu: &mut Npu) -> Vec<Vec<u8>> {
        let mut blocks = Vec::new();
        while let Some(pending) = npu.bip.upline_pending() {
            blocks.push(pending.content().to_vec());
            npu.bip.notify_upline_sent();
        }
        blocks
    }

    #[test]
    fn test_line_flushes_on_eol() {
        let mut npu = connected_npu();
        npu.async_process_upline_data(1, b"LOGIN\r");

        let blocks = upline_blocks(&mut npu);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block[BLK_OFF_CN], 1);
        assert_eq!(block_type(block[BLK_OFF_BTBSN]), BT_HT_MSG);
        assert_eq!(&block[BLK_OFF_DATA + 1..], b"LOGIN");
    }

    #[test]
    fn test_bsn_cycles_across_blocks() {
        let mut npu = connected_npu();
        let mut seen = Vec::new();
        for _ in 0..8 {
            npu.async_process_upline_data(1, b"A\r");
            let blocks = upline_blocks(&mut npu);
            seen.push(block_seq_no(blocks[0][BLK_OFF_BTBSN]));
        }
        // 1..7 is exhausted and wraps without ever producing 0.
        assert!(seen.iter().all(|&b| (1..=7).contains(&b)));
        assert_eq!(seen[0], seen[7]);
    }

    #[test]
    fn test_backspace_edits_input() {
        let mut npu = connected_npu();
        npu.async_process_upline_data(1, b"LOGX\x08IN\r");
        let blocks = upline_blocks(&mut npu);
        assert_eq!(&blocks[0][BLK_OFF_DATA + 1..], b"LOGIN");
    }

    #[test]
    fn test_cancel_discards_line() {
        let mut npu = connected_npu();
        // Cancel is control-X.
        npu.async_process_upline_data(1, b"JUNK\x18OK\r");
        let blocks = upline_blocks(&mut npu);
        assert_eq!(&blocks[0][BLK_OFF_DATA + 1..], b"OK");
    }

    #[test]
    fn test_block_limit_flushes_continued_block() {
        let mut npu = connected_npu();
        let long = vec![b'A'; npu.tcbs[0].block_limit()];
        npu.async_process_upline_data(1, &long);

        let blocks = upline_blocks(&mut npu);
        assert_eq!(blocks.len(), 1);
        // Size-limited flush is a continued block, not a message.
        assert_eq!(block_type(blocks[0][BLK_OFF_BTBSN]), BT_HT_BLK);
    }

    #[test]
    fn test_user_break_interrupts() {
        let mut npu = connected_npu();
        // Control-P is user break 1.
        npu.async_process_upline_data(1, b"\x10");
        assert!(npu.tcbs[0].break_pending);
    }

    #[test]
    fn test_xoff_xon_from_terminal() {
        let mut npu = connected_npu();
        npu.tcbs[0].params.out_flow_control = true;
        npu.async_process_upline_data(1, &[CHR_DC3]);
        assert!(npu.tcbs[0].xoff);
        npu.async_process_upline_data(1, &[CHR_DC1]);
        assert!(!npu.tcbs[0].xoff);
    }

    #[test]
    fn test_transparent_input_timer_flush() {
        let mut npu = connected_npu();
        crate::npu::tip::parse_fn_fv(
            &[FN_TD_X_INPUT, 1, FN_TD_X_TIMEOUT, 1],
            &mut npu.tcbs[0],
        );

        npu.async_process_upline_data(1, b"\x01\x02");
        assert!(npu.bip.upline_pending().is_none()); // waiting on timer

        // Expire the timer by hand rather than sleeping.
        npu.tcbs[0].x_input_timer =
            Some(std::time::Instant::now() - X_INPUT_TIMEOUT - Duration::from_millis(1));
        npu.async_check_input_timers();

        let blocks = upline_blocks(&mut npu);
        assert_eq!(blocks.len(), 1);
        assert_eq!(&blocks[0][BLK_OFF_DATA + 1..], b"\x01\x02");
    }

    #[test]
    fn test_downline_format_effector() {
        let mut npu = connected_npu();
        let mut bp = npu.bip.get_buffer().unwrap();
        bp.fill(&[
            ADDR_NPU,
            ADDR_HOST,
            1,
            btbsn(BT_HT_MSG, 3),
            0, // DBC: format effectors on
            b' ',
            b'R',
            b'E',
            b'A',
            b'D',
            b'Y',
        ]);
        npu.async_process_downline_data(1, bp, true);

        // No socket: the translated block sits in the output queue with
        // its BSN, unacknowledged.
        let queued = npu.tcbs[0].output_q.last().unwrap();
        assert_eq!(queued.content(), b"\r\nREADY");
        assert_eq!(queued.block_seq_no, 3);
        assert!(npu.bip.upline_pending().is_none());
    }

    #[test]
    fn test_downline_transparent_passthrough() {
        let mut npu = connected_npu();
        let mut bp = npu.bip.get_buffer().unwrap();
        bp.fill(&[
            ADDR_NPU,
            ADDR_HOST,
            1,
            btbsn(BT_HT_MSG, 2),
            DBC_TRANSPARENT,
            0x1B,
            b'[',
            b'2',
            b'J',
        ]);
        npu.async_process_downline_data(1, bp, true);
        let queued = npu.tcbs[0].output_q.last().unwrap();
        assert_eq!(queued.content(), &[0x1B, b'[', b'2', b'J']);
    }

    #[test]
    fn test_buffer_ownership_conserved() {
        // Every buffer returns to the pool once the host has drained the
        // upline traffic.
        let mut npu = connected_npu();
        let total = npu.bip.buffer_count();

        for _ in 0..5 {
            npu.async_process_upline_data(1, b"HELLO WORLD\r");
        }
        let _ = upline_blocks(&mut npu);
        assert_eq!(npu.bip.buffer_count(), total);
    }
}
