//! NPU end-to-end integration tests
//!
//! These run the whole terminal lifecycle against real TCP sockets: a
//! client connects, the SVM configure/connect handshakes complete, data
//! flows both ways, and a network drop unwinds back to idle through the
//! TCN exchange. The host side of each service message is played back
//! directly into the SVM, standing in for the guest operating system.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crate::config::ConnType;
use crate::npu::svm::SvmState;
use crate::npu::tip::TermConnState;
use crate::npu::{
    block_type, btbsn, Npu, ADDR_HOST, ADDR_NPU, BLK_OFF_BTBSN, BLK_OFF_P3, BLK_OFF_PFC,
    BT_HT_CMD, BT_HT_MSG, PFC_CNF, PFC_ICN, PFC_TCN, SFC_RESP, SFC_TA, SFC_TE,
};

/// A connected socket pair; the server side is adopted by the NPU.
fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

/// Pop the next upline block, or panic if none is pending.
fn take_upline(npu: &mut Npu) -> Vec<u8> {
    let block = npu
        .bip
        .upline_pending()
        .expect("an upline block should be pending")
        .content()
        .to_vec();
    npu.bip.notify_upline_sent();
    block
}

/// Feed a host reply into the SVM.
fn host_reply(npu: &mut Npu, message: &[u8]) {
    let mut bp = npu.bip.get_buffer().unwrap();
    bp.fill(message);
    npu.svm_process_buffer(bp);
}

/// Drain the client socket until `needle` shows up or the read times out.
fn read_until(client: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                seen.extend_from_slice(&chunk[..n]);
                if seen.windows(needle.len()).any(|w| w == needle) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    seen
}

/// Bring a fresh NPU to the supervised state and connect one client.
/// Returns the NPU (terminal host-connected) and the client socket.
fn connected_terminal() -> (Npu, TcpStream) {
    let mut npu = Npu::with_default_port(0);
    npu.svm.state = SvmState::Ready;

    let (mut client, server) = socket_pair();
    npu.net
        .incoming
        .lock()
        .unwrap()
        .push((server, ConnType::Raw));
    npu.net_check_status();
    assert_eq!(npu.tcbs[0].state, TermConnState::RequestConfig);

    // Host answers the configure request: an enabled class-3 terminal.
    let cnf = take_upline(&mut npu);
    assert_eq!(cnf[BLK_OFF_PFC], PFC_CNF);
    assert_eq!(cnf[BLK_OFF_P3], 1);
    let mut reply = vec![
        ADDR_NPU,
        ADDR_HOST,
        0,
        BT_HT_CMD,
        PFC_CNF,
        SFC_TE | SFC_RESP,
        1, // port
        0, // sub-port
        0,
        0, // addresses
        0, // device type
        0, // sub TIP
    ];
    reply.extend_from_slice(b"TTY01  ");
    reply.extend_from_slice(&[3, 0, 0, 2]); // class, status, last resp, code set
    host_reply(&mut npu, &reply);
    assert_eq!(npu.tcbs[0].state, TermConnState::RequestConnection);

    // Host grants the connection.
    let icn = take_upline(&mut npu);
    assert_eq!(icn[BLK_OFF_PFC], PFC_ICN);
    host_reply(
        &mut npu,
        &[ADDR_NPU, ADDR_HOST, 0, BT_HT_CMD, PFC_ICN, SFC_TE | SFC_RESP, 1],
    );
    assert_eq!(npu.tcbs[0].state, TermConnState::HostConnected);

    let banner = read_until(&mut client, b"Connected");
    assert!(banner.windows(9).any(|w| w == b"Connected"));

    (npu, client)
}

#[test]
fn test_terminal_connect_sequence_reaches_host_connected() {
    let (npu, _client) = connected_terminal();
    assert_eq!(npu.tcbs[0].state, TermConnState::HostConnected);
    assert!(npu.tcbs[0].enabled);
    assert_eq!(&npu.tcbs[0].term_name, b"TTY01  ");
}

#[test]
fn test_downline_data_reaches_client() {
    let (mut npu, mut client) = connected_terminal();

    let mut bp = npu.bip.get_buffer().unwrap();
    bp.fill(&[
        ADDR_NPU,
        ADDR_HOST,
        1,
        btbsn(BT_HT_MSG, 4),
        0,    // DBC
        b' ', // format effector: new line
        b'L',
        b'O',
        b'G',
        b'I',
        b'N',
        b'.',
    ]);
    npu.tip_process_buffer(bp, 0);

    let seen = read_until(&mut client, b"LOGIN.");
    assert!(seen.ends_with(b"\r\nLOGIN."));

    // The fully transmitted block was acknowledged with its BSN.
    let ack = take_upline(&mut npu);
    assert_eq!(
        crate::npu::block_seq_no(ack[BLK_OFF_BTBSN]),
        4,
        "BACK must echo the block sequence number"
    );
}

#[test]
fn test_upline_data_assembled_into_message_block() {
    let (mut npu, mut client) = connected_terminal();
    npu.tcbs[0].params.echoplex = false;

    client.write_all(b"HELLO\r").unwrap();
    // The poll path needs a few calls: one terminal read per cycle.
    for _ in 0..20 {
        npu.net_check_status();
        if npu.bip.upline_pending().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let block = take_upline(&mut npu);
    assert_eq!(block_type(block[BLK_OFF_BTBSN]), BT_HT_MSG);
    assert_eq!(block[2], 1); // connection number
    assert_eq!(&block[5..], b"HELLO");
}

#[test]
fn test_network_drop_unwinds_to_idle() {
    let (mut npu, client) = connected_terminal();
    drop(client);

    // The poll notices the close and asks the host to terminate.
    for _ in 0..20 {
        npu.net_check_status();
        if npu.tcbs[0].state == TermConnState::NpuDisconnect {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(npu.tcbs[0].state, TermConnState::NpuDisconnect);

    let tcn = take_upline(&mut npu);
    assert_eq!(tcn[BLK_OFF_PFC], PFC_TCN);
    assert_eq!(tcn[BLK_OFF_P3], 1);

    // The TCN/TA reply returns the port to idle, ready for the next
    // caller.
    host_reply(
        &mut npu,
        &[ADDR_NPU, ADDR_HOST, 0, BT_HT_CMD, PFC_TCN, SFC_TA | SFC_RESP, 1],
    );
    assert_eq!(npu.tcbs[0].state, TermConnState::Idle);
    assert!(npu.tcbs[0].stream.is_none());
}
