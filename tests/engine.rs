use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use rust_tcp::iface::Event;
use rust_tcp::transport::TcpOption;
use rust_tcp::{
    ConnectionId, Datagram, Error, EventLoop, MemoryChannel, NetworkInterface, Segment, TcpConfig,
    TcpFlags, TcpState,
};

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const PEER_PORT: u16 = 40000;
const IRS: u32 = 1000;

fn config() -> TcpConfig {
    TcpConfig {
        keepalive: None,
        ..TcpConfig::default()
    }
}

fn listening(config: TcpConfig) -> NetworkInterface {
    let mut iface = NetworkInterface::new(LOCAL, config);
    iface.listen(80).unwrap();
    iface
}

fn segment(seq: u32, ack: u32, flags: TcpFlags) -> Segment {
    let mut segment = Segment::new(PEER_PORT, 80, seq, ack, flags);
    segment.window = 65535;
    segment
}

fn inject(iface: &mut NetworkInterface, segment: &Segment, now: Instant) {
    iface.process_packet(&segment.encode(PEER, LOCAL).encode(), now);
}

fn decode(bytes: &[u8]) -> Segment {
    Segment::decode(&Datagram::decode(bytes).unwrap()).unwrap()
}

fn drain(iface: &mut NetworkInterface) -> Vec<Segment> {
    std::iter::from_fn(|| iface.dequeue_output())
        .map(|bytes| decode(&bytes))
        .collect()
}

/// Complete a passive open; returns the accepted handle and our ISS
fn handshake(iface: &mut NetworkInterface, syn: Segment, now: Instant) -> (ConnectionId, u32) {
    inject(iface, &syn, now);
    let syn_ack = drain(iface).remove(0);
    inject(iface, &segment(IRS + 1, syn_ack.seq.wrapping_add(1), TcpFlags::ACK), now);
    assert!(drain(iface).is_empty());
    let id = iface.accept(80).expect("handshake completed");
    (id, syn_ack.seq)
}

#[test]
fn passive_open_reaches_established() {
    let mut iface = listening(config());
    let now = Instant::now();

    inject(&mut iface, &segment(IRS, 0, TcpFlags::SYN), now);
    let out = drain(&mut iface);
    assert_eq!(out.len(), 1);
    let syn_ack = &out[0];
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(syn_ack.ack, IRS + 1);
    assert_eq!(syn_ack.src_port, 80);
    assert_eq!(syn_ack.dst_port, PEER_PORT);
    assert_eq!(syn_ack.mss(), Some(1460));
    let s0 = syn_ack.seq;

    // Not acceptable until the handshake completes
    assert_eq!(iface.accept(80), None);

    inject(&mut iface, &segment(IRS + 1, s0.wrapping_add(1), TcpFlags::ACK), now);
    let id = iface.accept(80).unwrap();
    assert_eq!(iface.state(id), Some(TcpState::Established));

    let connection = iface.connection(id).unwrap();
    assert_eq!(connection.snd_nxt(), s0.wrapping_add(1));
    assert_eq!(connection.snd_una(), s0.wrapping_add(1));
    assert_eq!(connection.rcv_nxt(), IRS + 1);
    assert_eq!(connection.quad().remote, SocketAddrV4::new(PEER, PEER_PORT));
}

#[test]
fn data_crossing_mss_arrives_in_order() {
    let mut iface = listening(config());
    let now = Instant::now();
    let mut syn = segment(IRS, 0, TcpFlags::SYN);
    syn.options = vec![TcpOption::MaxSegmentSize(1000)];
    let (id, iss) = handshake(&mut iface, syn, now);
    assert_eq!(iface.connection(id).unwrap().mss(), 1000);

    let inbound: Vec<u8> = (0..3000u32).map(|b| (b % 251) as u8).collect();
    let mut seq = IRS + 1;
    for chunk in inbound.chunks(1460) {
        let mut data = segment(seq, iss.wrapping_add(1), TcpFlags::ACK | TcpFlags::PSH);
        data.payload = chunk.to_vec();
        inject(&mut iface, &data, now);
        seq += chunk.len() as u32;
    }
    let acks = drain(&mut iface);
    assert_eq!(acks.last().map(|ack| ack.ack), Some(IRS + 3001));

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match iface.recv(id, &mut buf, now) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Error::WouldBlock) => break,
            Err(err) => panic!("unexpected {err}"),
        }
    }
    assert_eq!(received, inbound);

    // Outbound data is cut at the negotiated MSS
    let outbound = vec![0x5a; 2500];
    assert_eq!(iface.send(id, &outbound, now).unwrap(), 2500);
    let out = drain(&mut iface);
    let sizes: Vec<usize> = out.iter().map(|s| s.payload.len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    assert_eq!(out[0].seq, iss.wrapping_add(1));
    assert_eq!(out[1].seq, iss.wrapping_add(1001));
    assert_eq!(out[2].seq, iss.wrapping_add(2001));
}

#[test]
fn ack_beyond_snd_nxt_changes_nothing() {
    let mut iface = listening(config());
    let now = Instant::now();
    let (id, iss) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);
    iface.send(id, b"hello", now).unwrap();
    drain(&mut iface);

    inject(&mut iface, &segment(IRS + 1, iss.wrapping_add(500), TcpFlags::ACK), now);
    let connection = iface.connection(id).unwrap();
    assert_eq!(connection.snd_una(), iss.wrapping_add(1));
    assert_eq!(connection.unacknowledged(), 1);
    assert_eq!(iface.state(id), Some(TcpState::Established));

    let reply = drain(&mut iface);
    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].flags, TcpFlags::ACK);
    assert_eq!(reply[0].ack, IRS + 1);
}

#[test]
fn unacknowledged_data_retransmits_then_resets() {
    let config = TcpConfig {
        max_retries: 2,
        ..config()
    };
    let mut iface = listening(config);
    let start = Instant::now();
    let (id, iss) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), start);
    let rto = iface.connection(id).unwrap().rto();

    iface.send(id, b"ping", start).unwrap();
    assert_eq!(drain(&mut iface).len(), 1);

    let mut first_retransmit = None;
    let mut retransmits = 0;
    let mut resets = 0;
    while let Some(deadline) = iface.next_deadline() {
        iface.fire_next_timer(deadline);
        for segment in drain(&mut iface) {
            if segment.flags.contains(TcpFlags::RST) {
                resets += 1;
            } else {
                assert_eq!(segment.payload, b"ping");
                assert_eq!(segment.seq, iss.wrapping_add(1));
                first_retransmit.get_or_insert(deadline);
                retransmits += 1;
            }
        }
    }

    // An instant handshake leaves the timeout at its floor
    let first = first_retransmit.unwrap();
    assert_eq!(rto, Duration::from_millis(200));
    assert_eq!(first.duration_since(start), rto);
    assert_eq!(retransmits, 2);
    assert_eq!(resets, 1);
    assert_eq!(iface.stats().retransmissions, 2);
    assert_eq!(iface.connection_count(), 0);

    assert!(matches!(iface.send(id, b"x", start), Err(Error::ConnectionReset)));
    assert!(matches!(iface.recv(id, &mut [0u8; 4], start), Err(Error::InvalidHandle)));
}

#[test]
fn active_close_lingers_then_disappears() {
    let config = TcpConfig {
        time_wait: Duration::from_secs(30),
        ..config()
    };
    let mut iface = listening(config);
    let now = Instant::now();
    let (id, iss) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    iface.close(id, now).unwrap();
    assert_eq!(iface.state(id), Some(TcpState::FinWait1));
    let fin = drain(&mut iface).remove(0);
    assert!(fin.flags.contains(TcpFlags::FIN));
    assert_eq!(fin.seq, iss.wrapping_add(1));

    inject(&mut iface, &segment(IRS + 1, iss.wrapping_add(2), TcpFlags::ACK), now);
    assert_eq!(iface.state(id), Some(TcpState::FinWait2));

    inject(
        &mut iface,
        &segment(IRS + 1, iss.wrapping_add(2), TcpFlags::FIN | TcpFlags::ACK),
        now,
    );
    assert_eq!(iface.state(id), Some(TcpState::TimeWait));
    let ack = drain(&mut iface).remove(0);
    assert_eq!(ack.ack, IRS + 2);

    // Nothing happens before the linger deadline
    while iface.fire_next_timer(now + Duration::from_secs(29)) {}
    assert_eq!(iface.state(id), Some(TcpState::TimeWait));

    while iface.fire_next_timer(now + Duration::from_secs(30)) {}
    assert_eq!(iface.state(id), None);
    assert_eq!(iface.connection_count(), 0);
    assert!(matches!(iface.recv(id, &mut [0u8; 1], now), Err(Error::InvalidHandle)));
}

#[test]
fn fin_wait2_without_peer_fin_is_reaped() {
    let config = TcpConfig {
        fin_wait2_timeout: Duration::from_secs(20),
        ..config()
    };
    let mut iface = listening(config);
    let now = Instant::now();
    let (id, iss) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    iface.close(id, now).unwrap();
    drain(&mut iface);
    inject(&mut iface, &segment(IRS + 1, iss.wrapping_add(2), TcpFlags::ACK), now);
    assert_eq!(iface.state(id), Some(TcpState::FinWait2));

    while iface.fire_next_timer(now + Duration::from_secs(19)) {}
    assert_eq!(iface.state(id), Some(TcpState::FinWait2));

    while iface.fire_next_timer(now + Duration::from_secs(20)) {}
    assert_eq!(iface.state(id), None);
    assert_eq!(iface.connection_count(), 0);
    assert!(drain(&mut iface).is_empty());
    assert!(matches!(iface.recv(id, &mut [0u8; 1], now), Err(Error::InvalidHandle)));
}

#[test]
fn passive_close_reports_end_of_stream() {
    let mut iface = listening(config());
    let now = Instant::now();
    let (id, iss) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    let mut fin = segment(IRS + 1, iss.wrapping_add(1), TcpFlags::FIN | TcpFlags::ACK);
    fin.payload = b"last words".to_vec();
    inject(&mut iface, &fin, now);
    assert_eq!(iface.state(id), Some(TcpState::CloseWait));

    let mut buf = [0u8; 32];
    assert_eq!(iface.recv(id, &mut buf, now).unwrap(), 10);
    assert_eq!(iface.recv(id, &mut buf, now).unwrap(), 0);

    iface.close(id, now).unwrap();
    assert_eq!(iface.state(id), Some(TcpState::LastAck));
    let ours = drain(&mut iface);
    let fin_out = ours.iter().find(|s| s.flags.contains(TcpFlags::FIN)).unwrap();

    inject(
        &mut iface,
        &segment(IRS + 12, fin_out.seq.wrapping_add(1), TcpFlags::ACK),
        now,
    );
    assert_eq!(iface.state(id), None);
    // Orderly close is not a failure
    assert!(matches!(iface.send(id, b"x", now), Err(Error::InvalidHandle)));
}

#[test]
fn peer_reset_is_reported_once() {
    let mut iface = listening(config());
    let now = Instant::now();
    let (id, _) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    inject(&mut iface, &segment(IRS + 1, 0, TcpFlags::RST), now);
    assert_eq!(iface.state(id), None);
    assert!(matches!(iface.recv(id, &mut [0u8; 8], now), Err(Error::ConnectionReset)));
    assert!(matches!(iface.recv(id, &mut [0u8; 8], now), Err(Error::InvalidHandle)));
}

#[test]
fn closed_port_answers_with_reset() {
    let mut iface = listening(config());
    let now = Instant::now();
    let mut syn = Segment::new(PEER_PORT, 8080, 77, 0, TcpFlags::SYN);
    syn.window = 1024;
    inject(&mut iface, &syn, now);

    let out = drain(&mut iface);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(out[0].ack, 78);
    assert_eq!(out[0].src_port, 8080);
    assert_eq!(iface.stats().resets_sent, 1);
}

#[test]
fn full_table_refuses_new_connections() {
    let config = TcpConfig {
        max_connections: 1,
        ..config()
    };
    let mut iface = listening(config);
    let now = Instant::now();
    let (first, _) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    let mut other = Segment::new(PEER_PORT + 1, 80, 5000, 0, TcpFlags::SYN);
    other.window = 65535;
    inject(&mut iface, &other, now);

    let out = drain(&mut iface);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(out[0].ack, 5001);
    assert_eq!(iface.stats().refused, 1);
    // The existing connection is untouched
    assert_eq!(iface.state(first), Some(TcpState::Established));
    assert_eq!(iface.connection_count(), 1);
}

#[test]
fn one_connection_failing_leaves_others_alone() {
    let mut iface = listening(config());
    let now = Instant::now();
    let (first, _) = handshake(&mut iface, segment(IRS, 0, TcpFlags::SYN), now);

    let mut syn = Segment::new(PEER_PORT + 1, 80, 9000, 0, TcpFlags::SYN);
    syn.window = 65535;
    inject(&mut iface, &syn, now);
    let syn_ack = drain(&mut iface).remove(0);
    let mut ack = Segment::new(PEER_PORT + 1, 80, 9001, syn_ack.seq.wrapping_add(1), TcpFlags::ACK);
    ack.window = 65535;
    inject(&mut iface, &ack, now);
    let second = iface.accept(80).unwrap();

    inject(&mut iface, &segment(IRS + 1, 0, TcpFlags::RST), now);
    assert_eq!(iface.state(first), None);
    assert_eq!(iface.state(second), Some(TcpState::Established));
    assert_eq!(iface.send(second, b"still here", now).unwrap(), 10);
}

#[test]
fn event_loop_serves_a_connection() {
    let mut iface = NetworkInterface::new(LOCAL, config());
    iface.listen(80).unwrap();
    let mut event_loop = EventLoop::new(MemoryChannel::new(), iface);

    let syn = segment(IRS, 0, TcpFlags::SYN).encode(PEER, LOCAL).encode();
    event_loop.channel_mut().inject(syn);
    assert!(matches!(event_loop.turn().unwrap(), Event::Datagram(_)));
    let sent = event_loop.channel_mut().take_sent();
    let syn_ack = decode(&sent[0]);

    let mut data = segment(IRS + 1, syn_ack.seq.wrapping_add(1), TcpFlags::ACK | TcpFlags::PSH);
    data.payload = b"echo me".to_vec();
    let ack = segment(IRS + 1, syn_ack.seq.wrapping_add(1), TcpFlags::ACK);
    event_loop.channel_mut().inject(ack.encode(PEER, LOCAL).encode());
    event_loop.channel_mut().inject(data.encode(PEER, LOCAL).encode());
    event_loop.turn().unwrap();
    event_loop.turn().unwrap();

    let now = Instant::now();
    let iface = event_loop.iface_mut();
    let id = iface.accept(80).unwrap();
    let mut buf = [0u8; 16];
    let n = iface.recv(id, &mut buf, now).unwrap();
    assert_eq!(&buf[..n], b"echo me");
    iface.send(id, &buf[..n], now).unwrap();
    event_loop.flush_output();

    let replies: Vec<Segment> = event_loop
        .channel_mut()
        .take_sent()
        .iter()
        .map(|bytes| decode(bytes))
        .collect();
    let echoed = replies.iter().find(|s| !s.payload.is_empty()).unwrap();
    assert_eq!(echoed.payload, b"echo me");
    assert_eq!(echoed.ack, IRS + 8);
}
