//! NPU network layer
//!
//! A dedicated listener thread accepts TCP connections and hands them to
//! the channel-step path through a mutex-protected mailbox. All data I/O
//! is non-blocking and happens during `net_check_status`, which the
//! scheduler calls every major cycle: the poll index walks the terminals
//! round-robin so high-numbered connections are not starved behind busy
//! low-numbered ones.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::{ConnType, NpuPortEntry};
use crate::npu::tip::TermConnState;
use crate::npu::Npu;

const CONNECTING_MSG: &[u8] = b"\r\nConnecting to host - please wait ...\r\n";
const CONNECTED_MSG: &[u8] = b"\r\nConnected\r\n\n";
const ABORT_MSG: &[u8] = b"\r\nConnection aborted\r\n";
const NOT_READY_MSG: &[u8] =
    b"\r\nHost not ready to accept connections - please try again later.\r\n";
const NO_PORTS_MSG: &[u8] = b"\r\nNo free ports available - please try again later.\r\n";

/// Listener poll period.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Read chunk per poll.
const READ_CHUNK: usize = 256;

pub struct Net {
    ports: Vec<NpuPortEntry>,
    /// Connections accepted by the listener thread, waiting for adoption
    /// on the channel-step path.
    pub(crate) incoming: Arc<Mutex<Vec<(TcpStream, ConnType)>>>,
    poll_index: usize,
    started: bool,
}

impl Net {
    pub fn new(ports: &[NpuPortEntry]) -> Net {
        Net {
            ports: ports.to_vec(),
            incoming: Arc::new(Mutex::new(Vec::new())),
            poll_index: 0,
            started: false,
        }
    }

    /// Spawn the listener thread. Idempotent.
    pub fn start_listeners(&mut self, active: Arc<AtomicBool>) -> std::io::Result<()> {
        if self.started || self.ports.is_empty() {
            return Ok(());
        }

        let mut listeners = Vec::new();
        for port in &self.ports {
            let listener = TcpListener::bind(("0.0.0.0", port.tcp_port))?;
            listener.set_nonblocking(true)?;
            info!(
                "npu: listening on port {} ({} connections)",
                port.tcp_port, port.max_conns
            );
            listeners.push((listener, port.conn_type));
        }

        let incoming = Arc::clone(&self.incoming);
        thread::Builder::new()
            .name("npu-listener".to_string())
            .spawn(move || {
                while active.load(Ordering::Relaxed) {
                    for (listener, conn_type) in &listeners {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                info!("npu: connection from {}", peer);
                                incoming
                                    .lock()
                                    .expect("npu incoming lock")
                                    .push((stream, *conn_type));
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => warn!("npu: accept failed: {}", e),
                        }
                    }
                    thread::sleep(ACCEPT_POLL);
                }
            })?;

        self.started = true;
        Ok(())
    }
}

impl Npu {
    /// Per-cycle network service: adopt newly accepted connections, then
    /// poll one ready terminal for data.
    pub fn net_check_status(&mut self) {
        self.net_adopt_incoming();
        self.net_poll();
        self.async_check_input_timers();
    }

    /// Pull accepted sockets out of the listener mailbox and bind them to
    /// free terminal control blocks.
    fn net_adopt_incoming(&mut self) {
        let pending: Vec<(TcpStream, ConnType)> = {
            let mut incoming = self.net.incoming.lock().expect("npu incoming lock");
            incoming.drain(..).collect()
        };

        for (mut stream, conn_type) in pending {
            if !self.is_ready() {
                let _ = stream.write_all(NOT_READY_MSG);
                continue; // dropped; the client retries later
            }

            let free = self
                .tcbs
                .iter()
                .position(|t| t.state == TermConnState::Idle && t.conn_type == conn_type);
            let index = match free {
                Some(index) => index,
                None => {
                    let _ = stream.write_all(NO_PORTS_MSG);
                    continue;
                }
            };

            if stream.set_nonblocking(true).is_err() {
                continue;
            }
            let _ = stream.write_all(CONNECTING_MSG);

            let cn = (index + 1) as u8;
            {
                let tcb = &mut self.tcbs[index];
                tcb.stream = Some(stream);
                tcb.state = TermConnState::NetConnected;
                tcb.xoff = false;
                tcb.break_pending = false;
                tcb.input_reset();
            }

            if !self.svm_connect_terminal(cn) {
                // Could not start the host sequence (no buffers): abort.
                self.net_disconnected(cn);
            }
        }
    }

    /// Round-robin data poll. Services at most one terminal with input
    /// per call and resumes behind it next cycle.
    fn net_poll(&mut self) {
        while self.net.poll_index < self.tcbs.len() {
            let index = self.net.poll_index;
            self.net.poll_index += 1;
            let cn = (index + 1) as u8;

            if self.tcbs[index].stream.is_none() {
                continue;
            }

            // Drain pending output first; it never blocks the poll.
            self.net_try_output(cn);

            let mut chunk = [0u8; READ_CHUNK];
            let read = match self.tcbs[index].stream.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => continue,
            };

            match read {
                Ok(0) => {
                    // Peer closed: tell the host, drop the socket.
                    self.tcbs[index].stream = None;
                    self.svm_disc_request_terminal(cn);
                }
                Ok(n) => {
                    if self.tcbs[index].state == TermConnState::HostConnected {
                        self.async_process_upline_data(cn, &chunk[..n]);
                    }
                    // One serviced terminal per call keeps the poll fair.
                    return;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("npu: read failed on connection {}: {}", cn, e);
                    self.tcbs[index].stream = None;
                    self.svm_disc_request_terminal(cn);
                }
            }
        }
        self.net.poll_index = 0;
    }

    /// Host accepted the connection: the terminal is live.
    pub fn net_connected(&mut self, cn: u8) {
        if let Some(tcb) = self.tcb(cn) {
            tcb.state = TermConnState::HostConnected;
            if let Some(stream) = tcb.stream.as_mut() {
                let _ = stream.write_all(CONNECTED_MSG);
            }
        }
    }

    /// Drop the network side of a connection and return the TCB to idle.
    pub fn net_disconnected(&mut self, cn: u8) {
        self.tip_discard_output_q(cn);
        if let Some(tcb) = self.tcb(cn) {
            if let Some(mut stream) = tcb.stream.take() {
                let _ = stream.write_all(ABORT_MSG);
            }
            tcb.state = TermConnState::Idle;
            tcb.xoff = false;
            tcb.input_reset();
        }
    }

    /// Queue translated output for a terminal and try to push it out.
    pub(crate) fn net_queue_output(&mut self, cn: u8, data: &[u8], block_seq_no: u8) {
        match self.bip.get_buffer() {
            Some(mut bp) => {
                bp.fill(data);
                bp.block_seq_no = block_seq_no;
                if let Some(tcb) = self.tcb(cn) {
                    tcb.output_q.append(bp);
                } else {
                    self.bip.release_buffer(bp);
                    return;
                }
                self.net_try_output(cn);
            }
            None => warn!("npu: output for connection {} dropped, out of buffers", cn),
        }
    }

    /// Push queued output to the socket without blocking. Fully sent
    /// blocks that carry a sequence number are acknowledged upline.
    pub(crate) fn net_try_output(&mut self, cn: u8) {
        if cn == 0 || cn as usize > self.tcbs.len() {
            return;
        }

        loop {
            let index = cn as usize - 1;
            let tcb = &mut self.tcbs[index];
            if tcb.xoff || tcb.stream.is_none() {
                return;
            }
            let mut bp = match tcb.output_q.extract() {
                Some(bp) => bp,
                None => return,
            };

            let stream = tcb.stream.as_mut().expect("checked above");
            match stream.write(bp.remaining()) {
                Ok(written) => {
                    bp.offset += written as u16;
                    if bp.offset < bp.num_bytes {
                        tcb.output_q.prepend(bp);
                        return; // socket saturated
                    }
                    let bsn = bp.block_seq_no;
                    self.bip.release_buffer(bp);
                    if bsn != 0 {
                        self.tip_notify_sent(cn, bsn);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    tcb.output_q.prepend(bp);
                    return;
                }
                Err(e) => {
                    warn!("npu: write failed on connection {}: {}", cn, e);
                    self.bip.release_buffer(bp);
                    self.tcbs[index].stream = None;
                    self.svm_disc_request_terminal(cn);
                    return;
                }
            }
        }
    }

    /// Raw send used for echo and canned text: bypasses the output queue
    /// when it is empty, otherwise keeps ordering by queueing.
    pub(crate) fn net_send(&mut self, cn: u8, data: &[u8]) {
        let direct = match self.tcb(cn) {
            Some(tcb) => tcb.output_q.is_empty() && !tcb.xoff,
            None => return,
        };
        if direct {
            let tcb = self.tcb(cn).expect("checked above");
            if let Some(stream) = tcb.stream.as_mut() {
                match stream.write(data) {
                    Ok(written) if written == data.len() => return,
                    Ok(written) => {
                        let rest = data[written..].to_vec();
                        self.net_queue_output(cn, &rest, 0);
                        return;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(_) => return,
                }
            } else {
                return;
            }
        }
        self.net_queue_output(cn, data, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npu::svm::SvmState;
    use std::net::TcpListener as StdListener;

    /// A connected socket pair for exercising the poll path.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn test_adoption_requires_ready_host() {
        let mut npu = Npu::with_default_port(0);
        let (client, server) = socket_pair();
        npu.net
            .incoming
            .lock()
            .unwrap()
            .push((server, ConnType::Raw));

        // SVM not ready: the connection is refused.
        npu.net_check_status();
        assert_eq!(npu.tcbs[0].state, TermConnState::Idle);
        assert!(npu.tcbs[0].stream.is_none());
        drop(client);
    }

    #[test]
    fn test_adoption_starts_connect_sequence() {
        let mut npu = Npu::with_default_port(0);
        npu.svm.state = SvmState::Ready;
        let (client, server) = socket_pair();
        npu.net
            .incoming
            .lock()
            .unwrap()
            .push((server, ConnType::Raw));

        npu.net_check_status();
        assert_eq!(npu.tcbs[0].state, TermConnState::RequestConfig);
        assert!(npu.tcbs[0].stream.is_some());
        // The CNF/TE went upline.
        assert!(npu.bip.upline_pending().is_some());
        drop(client);
    }

    #[test]
    fn test_peer_close_requests_disconnect() {
        let mut npu = Npu::with_default_port(0);
        npu.svm.state = SvmState::Ready;
        let (client, server) = socket_pair();
        npu.tcbs[0].stream = Some(server);
        npu.tcbs[0].state = TermConnState::HostConnected;
        drop(client); // peer goes away

        npu.net_check_status();
        assert_eq!(npu.tcbs[0].state, TermConnState::NpuDisconnect);
        assert!(npu.tcbs[0].stream.is_none());
        // The TCN/TA/R went upline.
        let tcn = npu.bip.upline_pending().unwrap().content().to_vec();
        assert_eq!(tcn[crate::npu::BLK_OFF_PFC], crate::npu::PFC_TCN);
        assert_eq!(tcn[crate::npu::BLK_OFF_P3], 1);
    }

    #[test]
    fn test_output_acknowledged_when_sent() {
        let mut npu = Npu::with_default_port(0);
        let (client, server) = socket_pair();
        npu.tcbs[0].stream = Some(server);
        npu.tcbs[0].state = TermConnState::HostConnected;

        npu.net_queue_output(1, b"HELLO", 5);
        // Fully written: a BACK with BSN 5 is upline.
        let ack = npu.bip.upline_pending().unwrap().content().to_vec();
        assert_eq!(
            crate::npu::block_type(ack[crate::npu::BLK_OFF_BTBSN]),
            crate::npu::BT_HT_BACK
        );
        assert_eq!(crate::npu::block_seq_no(ack[crate::npu::BLK_OFF_BTBSN]), 5);

        let mut client = client;
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLO");
    }

    #[test]
    fn test_xoff_holds_output() {
        let mut npu = Npu::with_default_port(0);
        let (client, server) = socket_pair();
        npu.tcbs[0].stream = Some(server);
        npu.tcbs[0].state = TermConnState::HostConnected;
        npu.tcbs[0].xoff = true;

        npu.net_queue_output(1, b"WAIT", 3);
        assert!(npu.tcbs[0].output_q.not_empty());
        assert!(npu.bip.upline_pending().is_none()); // no ack yet

        npu.tcbs[0].xoff = false;
        npu.net_try_output(1);
        assert!(npu.tcbs[0].output_q.is_empty());
        drop(client);
    }
}
