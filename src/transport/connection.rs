//! TCP connection state machine
//!
//! One [`Connection`] per 4-tuple. It is mutated only by an inbound segment,
//! a fired timer, or a local request (send, receive, close, abort), and each
//! of those runs to completion. Segments it wants transmitted are queued on
//! the connection and collected by the interface afterwards.

use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::transport::rtt::RttEstimator;
use crate::transport::seq;
use crate::transport::tcp::{Segment, TcpFlags, TcpOption, DEFAULT_PEER_MSS};
use crate::transport::timer::{TimerEntry, TimerKind, TimerScheduler, TimerSlot};

/// Identity of a connection, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique TCP connection, identified by both endpoints
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Quad {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpState {
    /// States in which both sides' initial sequence numbers are known
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            TcpState::Listen | TcpState::SynSent | TcpState::SynReceived | TcpState::Closed
        )
    }
}

/// Why a connection reached Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly teardown, or a local close before the handshake finished
    Normal,
    /// Peer sent an acceptable RST
    Reset,
    /// Peer refused our SYN
    Refused,
    /// Retransmissions or keepalive probes exhausted
    TimedOut,
    /// Local abort
    Aborted,
}

impl CloseReason {
    /// The failure the application should see for this closure, if any
    pub fn as_error(&self) -> Option<Error> {
        match self {
            CloseReason::Reset | CloseReason::TimedOut => Some(Error::ConnectionReset),
            CloseReason::Refused => Some(Error::ConnectionRefused),
            CloseReason::Normal | CloseReason::Aborted => None,
        }
    }
}

/// What a fired timer did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Superseded or cancelled entry
    Stale,
    Idle,
    Retransmitted,
    KeepaliveProbe,
    TimeWaitExpired,
    /// FinWait2 idled out waiting for the peer's FIN
    FinWait2Expired,
    Aborted,
}

/// Send Sequence Space (RFC 793 3.2)
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
/// ```
#[derive(Debug, Clone, Copy, Default)]
struct SendSequenceSpace {
    /// initial send sequence number
    iss: u32,
    /// oldest unacknowledged; everything before it is acked
    una: u32,
    /// next to send, also the highest ever sent
    nxt: u32,
    /// peer's advertised window
    wnd: u32,
    /// segment sequence number used for last window update
    wl1: u32,
    /// segment acknowledgment number used for last window update
    wl2: u32,
}

/// Receive Sequence Space (RFC 793 3.2)
#[derive(Debug, Clone, Copy, Default)]
struct RecvSequenceSpace {
    /// initial receive sequence number
    irs: u32,
    /// next expected
    nxt: u32,
}

/// Sent but unacknowledged segment
#[derive(Debug, Clone)]
struct RetransmitEntry {
    seq: u32,
    flags: TcpFlags,
    payload: Vec<u8>,
    sent_at: Instant,
    transmissions: u32,
    /// Timeouts since the peer last showed signs of life
    retries: u32,
    /// One-byte probe into a closed window
    probe: bool,
}

impl RetransmitEntry {
    fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

#[derive(Debug, Default)]
struct Timers {
    retransmission: TimerSlot,
    time_wait: TimerSlot,
    keepalive: TimerSlot,
    fin_wait2: TimerSlot,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Retransmission => &mut self.retransmission,
            TimerKind::TimeWait => &mut self.time_wait,
            TimerKind::Keepalive => &mut self.keepalive,
            TimerKind::FinWait2 => &mut self.fin_wait2,
        }
    }

    fn disarm_all(&mut self) {
        self.retransmission.disarm();
        self.time_wait.disarm();
        self.keepalive.disarm();
        self.fin_wait2.disarm();
    }
}

/// TCP connection structure
///
/// Manages the state, buffers and timers of one connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    quad: Quad,
    state: TcpState,
    config: TcpConfig,
    snd: SendSequenceSpace,
    rcv: RecvSequenceSpace,
    /// Effective send MSS after negotiation
    mss: u16,
    rtt: RttEstimator,
    /// Consecutive retransmission timeouts since the last new ACK
    backoff: u32,
    /// Application bytes not yet segmented
    send_buffer: VecDeque<u8>,
    retransmit: VecDeque<RetransmitEntry>,
    /// In-order bytes not yet read by the application
    recv_buffer: VecDeque<u8>,
    /// Segments above RCV.NXT awaiting the gap to fill, bounded by the window
    out_of_order: Vec<(u32, Vec<u8>)>,
    out_of_order_bytes: usize,
    fin_requested: bool,
    fin_seq: Option<u32>,
    peer_fin: bool,
    ack_pending: bool,
    last_advertised: u16,
    timers: Timers,
    last_activity: Instant,
    keepalive_probes: u32,
    close_reason: Option<CloseReason>,
    exposed: bool,
    outgoing: VecDeque<Segment>,
}

impl Connection {
    fn new(
        id: ConnectionId,
        quad: Quad,
        state: TcpState,
        iss: u32,
        config: &TcpConfig,
        now: Instant,
    ) -> Self {
        Connection {
            id,
            quad,
            state,
            config: config.clone(),
            snd: SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss,
                ..Default::default()
            },
            rcv: RecvSequenceSpace::default(),
            mss: cmp::min(config.mss, DEFAULT_PEER_MSS),
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            backoff: 0,
            send_buffer: VecDeque::new(),
            retransmit: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            out_of_order: Vec::new(),
            out_of_order_bytes: 0,
            fin_requested: false,
            fin_seq: None,
            peer_fin: false,
            ack_pending: false,
            last_advertised: 0,
            timers: Timers::default(),
            last_activity: now,
            keepalive_probes: 0,
            close_reason: None,
            exposed: false,
            outgoing: VecDeque::new(),
        }
    }

    /// Passive open: answer `syn` with SYN-ACK and enter SynReceived
    pub fn accept(
        id: ConnectionId,
        quad: Quad,
        syn: &Segment,
        iss: u32,
        config: &TcpConfig,
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> Self {
        let mut connection = Connection::new(id, quad, TcpState::SynReceived, iss, config, now);
        connection.rcv.irs = syn.seq;
        connection.rcv.nxt = syn.seq.wrapping_add(1);
        connection.negotiate_mss(syn);
        connection.snd.wnd = syn.window as u32;
        connection.snd.wl1 = syn.seq;

        debug!("[{id}] {quad} LISTEN -> SYN_RECEIVED (iss={iss}, irs={})", syn.seq);
        connection.transmit_new(TcpFlags::SYN | TcpFlags::ACK, Vec::new(), now, timers);
        connection
    }

    /// Active open: send SYN and enter SynSent
    pub fn connect(
        id: ConnectionId,
        quad: Quad,
        iss: u32,
        config: &TcpConfig,
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> Self {
        let mut connection = Connection::new(id, quad, TcpState::SynSent, iss, config, now);
        debug!("[{id}] {quad} CLOSED -> SYN_SENT (iss={iss})");
        connection.transmit_new(TcpFlags::SYN, Vec::new(), now, timers);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn quad(&self) -> Quad {
        self.quad
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn snd_una(&self) -> u32 {
        self.snd.una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd.nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv.nxt
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn rto(&self) -> Duration {
        self.rtt.backed_off(self.backoff)
    }

    /// Smoothed round-trip time, once a sample has been taken
    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    /// Bytes available to [`Connection::read`]
    pub fn readable(&self) -> usize {
        self.recv_buffer.len()
    }

    /// Segments sent and still awaiting acknowledgment
    pub fn unacknowledged(&self) -> usize {
        self.retransmit.len()
    }

    pub fn is_exposed(&self) -> bool {
        self.exposed
    }

    /// Mark as handed to the application, so failures are reported to it
    pub fn expose(&mut self) {
        self.exposed = true;
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Segment> + '_ {
        self.outgoing.drain(..)
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Process incoming TCP segment
    pub fn on_segment(&mut self, seg: &Segment, now: Instant, timers: &mut TimerScheduler) {
        match self.state {
            TcpState::Listen | TcpState::Closed => return,
            TcpState::SynSent => self.on_segment_syn_sent(seg, now, timers),
            _ => self.on_segment_synchronized(seg, now, timers),
        }
        self.flush(now, timers);
    }

    fn on_segment_syn_sent(&mut self, seg: &Segment, now: Instant, timers: &mut TimerScheduler) {
        let has_ack = seg.flags.contains(TcpFlags::ACK);

        if has_ack && (seq::le(seg.ack, self.snd.iss) || seq::gt(seg.ack, self.snd.nxt)) {
            if !seg.flags.contains(TcpFlags::RST) {
                trace!("[{}] (SYN_SENT) unacceptable ack {}", self.id, seg.ack);
                self.send_reset(seg.ack);
            }
            return;
        }

        if seg.flags.contains(TcpFlags::RST) {
            if has_ack {
                self.terminate(CloseReason::Refused);
            }
            return;
        }

        if !seg.flags.contains(TcpFlags::SYN) {
            return;
        }

        self.rcv.irs = seg.seq;
        self.rcv.nxt = seg.seq.wrapping_add(1);
        self.negotiate_mss(seg);
        self.snd.wnd = seg.window as u32;
        self.snd.wl1 = seg.seq;
        self.snd.wl2 = seg.ack;
        self.last_activity = now;

        if has_ack {
            self.handle_ack(seg.ack, now, timers);
            self.transition(TcpState::Established, now, timers);
            self.ack_pending = true;
        } else {
            // Simultaneous open: our SYN goes out again as SYN-ACK
            self.transition(TcpState::SynReceived, now, timers);
            for entry in self.retransmit.iter_mut() {
                if entry.flags.contains(TcpFlags::SYN) {
                    entry.flags |= TcpFlags::ACK;
                }
            }
            let syn_ack = self.segment(self.snd.iss, TcpFlags::SYN | TcpFlags::ACK, Vec::new());
            self.emit(syn_ack);
        }
    }

    fn on_segment_synchronized(
        &mut self,
        seg: &Segment,
        now: Instant,
        timers: &mut TimerScheduler,
    ) {
        let flags = seg.flags;

        // Peer retransmitted its SYN: our SYN-ACK was lost
        if self.state == TcpState::SynReceived
            && flags.contains(TcpFlags::SYN)
            && !flags.contains(TcpFlags::ACK)
            && seg.seq == self.rcv.irs
        {
            let syn_ack = self.segment(self.snd.iss, TcpFlags::SYN | TcpFlags::ACK, Vec::new());
            self.emit(syn_ack);
            return;
        }

        if !self.acceptable(seg.seq, seg.seq_len()) {
            if !flags.contains(TcpFlags::RST) {
                trace!(
                    "[{}] ({:?}) segment seq={} outside window at {}",
                    self.id,
                    self.state,
                    seg.seq,
                    self.rcv.nxt
                );
                if self.state == TcpState::TimeWait && flags.contains(TcpFlags::FIN) {
                    self.timers.time_wait.arm(
                        timers,
                        self.id,
                        TimerKind::TimeWait,
                        now + self.config.time_wait,
                    );
                }
                self.ack_pending = true;
            }
            return;
        }

        self.last_activity = now;
        self.keepalive_probes = 0;

        if flags.contains(TcpFlags::RST) {
            debug!("[{}] ({:?}) reset by peer", self.id, self.state);
            self.terminate(CloseReason::Reset);
            return;
        }

        if flags.contains(TcpFlags::SYN) {
            if self.state == TcpState::TimeWait {
                // Closed cleanly already; only remind the peer where we are
                self.ack_pending = true;
                return;
            }
            warn!("[{}] ({:?}) SYN inside window, aborting", self.id, self.state);
            self.send_reset(self.snd.nxt);
            self.terminate(CloseReason::Reset);
            return;
        }

        if !flags.contains(TcpFlags::ACK) {
            return;
        }

        if self.state == TcpState::SynReceived {
            if seq::gt(seg.ack, self.snd.una) && seq::le(seg.ack, self.snd.nxt) {
                self.transition(TcpState::Established, now, timers);
            } else {
                self.send_reset(seg.ack);
                return;
            }
        }

        if seq::gt(seg.ack, self.snd.nxt) {
            // Acknowledges data never sent; leave state untouched
            trace!(
                "[{}] ({:?}) ack {} beyond snd.nxt {}",
                self.id,
                self.state,
                seg.ack,
                self.snd.nxt
            );
            self.ack_pending = true;
            return;
        }

        if seq::gt(seg.ack, self.snd.una) {
            self.handle_ack(seg.ack, now, timers);
        }

        if seq::lt(self.snd.wl1, seg.seq)
            || (self.snd.wl1 == seg.seq && seq::le(self.snd.wl2, seg.ack))
        {
            self.snd.wnd = seg.window as u32;
            self.snd.wl1 = seg.seq;
            self.snd.wl2 = seg.ack;
        }

        // The peer answered our window probe, so it is still there
        if self.snd.wnd == 0 && seg.ack == self.snd.una {
            if let Some(front) = self.retransmit.front_mut().filter(|entry| entry.probe) {
                front.retries = 0;
            }
        }

        let fin_acked = self
            .fin_seq
            .is_some_and(|fin| seq::gt(self.snd.una, fin));
        match self.state {
            TcpState::FinWait1 if fin_acked => {
                self.transition(TcpState::FinWait2, now, timers);
            }
            TcpState::Closing if fin_acked => {
                self.transition(TcpState::TimeWait, now, timers);
            }
            TcpState::LastAck if fin_acked => {
                self.terminate(CloseReason::Normal);
                return;
            }
            _ => {}
        }

        if !seg.payload.is_empty()
            && matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            self.receive_payload(seg.seq, &seg.payload);
        }

        if flags.contains(TcpFlags::FIN) {
            let fin = seg.seq.wrapping_add(seg.payload.len() as u32);
            if fin == self.rcv.nxt {
                self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
                self.peer_fin = true;
                self.ack_pending = true;
                match self.state {
                    TcpState::Established => self.transition(TcpState::CloseWait, now, timers),
                    TcpState::FinWait1 => self.transition(TcpState::Closing, now, timers),
                    TcpState::FinWait2 => self.transition(TcpState::TimeWait, now, timers),
                    _ => {}
                }
            }
        }
    }

    /// Segment acceptance test (RFC 793 3.3)
    ///
    /// A zero window still admits a segment starting exactly at RCV.NXT so
    /// its ACK and RST are processed; any text it carries is trimmed away.
    fn acceptable(&self, seg_seq: u32, seg_len: u32) -> bool {
        let nxt = self.rcv.nxt;
        let wnd = self.recv_window();
        let end = nxt.wrapping_add(wnd);
        match (seg_len, wnd) {
            (0, 0) => seg_seq == nxt,
            (0, _) => seq::in_window(nxt, seg_seq, end),
            (_, 0) => seg_seq == nxt,
            (len, _) => {
                seq::in_window(nxt, seg_seq, end)
                    || seq::in_window(nxt, seg_seq.wrapping_add(len - 1), end)
            }
        }
    }

    fn receive_payload(&mut self, seg_seq: u32, payload: &[u8]) {
        self.ack_pending = true;

        let mut start = seg_seq;
        let mut data = payload;
        if seq::lt(start, self.rcv.nxt) {
            let skip = seq::distance(start, self.rcv.nxt) as usize;
            if skip >= data.len() {
                return;
            }
            data = &data[skip..];
            start = self.rcv.nxt;
        }

        let window = self.recv_window() as usize;
        let offset = seq::distance(self.rcv.nxt, start) as usize;
        if offset >= window {
            return;
        }
        let data = &data[..cmp::min(data.len(), window - offset)];

        if offset == 0 {
            self.recv_buffer.extend(data);
            self.rcv.nxt = self.rcv.nxt.wrapping_add(data.len() as u32);
            self.drain_out_of_order();
        } else {
            self.hold_out_of_order(start, data);
        }
    }

    fn hold_out_of_order(&mut self, start: u32, data: &[u8]) {
        if self
            .out_of_order
            .iter()
            .any(|(s, d)| *s == start && d.len() >= data.len())
        {
            return;
        }
        if self.out_of_order_bytes + data.len() > self.recv_window() as usize {
            trace!("[{}] out-of-order capacity exceeded, dropping", self.id);
            return;
        }
        self.out_of_order_bytes += data.len();
        self.out_of_order.push((start, data.to_vec()));
    }

    fn drain_out_of_order(&mut self) {
        loop {
            let nxt = self.rcv.nxt;
            // Discard entries wholly at or below RCV.NXT
            let mut released = 0;
            self.out_of_order.retain(|(s, d)| {
                let keep = seq::gt(s.wrapping_add(d.len() as u32), nxt);
                if !keep {
                    released += d.len();
                }
                keep
            });
            self.out_of_order_bytes -= released;

            let Some(pos) = self.out_of_order.iter().position(|(s, _)| seq::le(*s, nxt)) else {
                break;
            };
            let (start, data) = self.out_of_order.remove(pos);
            self.out_of_order_bytes -= data.len();
            let skip = seq::distance(start, nxt) as usize;
            self.recv_buffer.extend(&data[skip..]);
            self.rcv.nxt = nxt.wrapping_add((data.len() - skip) as u32);
        }
    }

    fn handle_ack(&mut self, ack: u32, now: Instant, timers: &mut TimerScheduler) {
        self.snd.una = ack;

        let mut sampled = false;
        while let Some(front) = self.retransmit.front() {
            if !seq::le(front.end(), ack) {
                break;
            }
            if let Some(entry) = self.retransmit.pop_front() {
                // Karn: only segments sent once yield a sample
                if entry.transmissions == 1 && !sampled {
                    self.rtt.sample(now.saturating_duration_since(entry.sent_at));
                    sampled = true;
                }
            }
        }

        self.backoff = 0;
        if self.retransmit.is_empty() {
            self.timers.retransmission.disarm();
        } else {
            self.timers.retransmission.arm(
                timers,
                self.id,
                TimerKind::Retransmission,
                now + self.rtt.rto(),
            );
        }
    }

    fn negotiate_mss(&mut self, syn: &Segment) {
        let peer = syn.mss().unwrap_or(DEFAULT_PEER_MSS);
        self.mss = cmp::max(1, cmp::min(self.config.mss, peer));
    }

    /// Window we can advertise: free receive buffer space
    fn recv_window(&self) -> u32 {
        let free = self.config.recv_buffer.saturating_sub(self.recv_buffer.len());
        cmp::min(free, u16::MAX as usize) as u32
    }

    fn segment(&mut self, seq: u32, flags: TcpFlags, payload: Vec<u8>) -> Segment {
        let ack = if flags.contains(TcpFlags::ACK) {
            self.rcv.nxt
        } else {
            0
        };
        let (src, dst) = (self.quad.local.port(), self.quad.remote.port());
        let mut segment = Segment::new(src, dst, seq, ack, flags);
        segment.window = self.recv_window() as u16;
        self.last_advertised = segment.window;
        if flags.contains(TcpFlags::SYN) {
            segment.options.push(TcpOption::MaxSegmentSize(self.config.mss));
        }
        segment.payload = payload;
        segment
    }

    fn emit(&mut self, segment: Segment) {
        if segment.flags.contains(TcpFlags::ACK) {
            self.ack_pending = false;
        }
        self.outgoing.push_back(segment);
    }

    /// Send a segment that occupies sequence space and track it for retransmission
    fn transmit_new(
        &mut self,
        flags: TcpFlags,
        payload: Vec<u8>,
        now: Instant,
        timers: &mut TimerScheduler,
    ) {
        let seq = self.snd.nxt;
        let segment = self.segment(seq, flags, payload.clone());
        let entry = RetransmitEntry {
            seq,
            flags,
            payload,
            sent_at: now,
            transmissions: 1,
            retries: 0,
            probe: false,
        };
        self.snd.nxt = entry.end();
        self.retransmit.push_back(entry);

        if !self.timers.retransmission.is_armed() {
            let rto = self.rtt.backed_off(self.backoff);
            self.timers
                .retransmission
                .arm(timers, self.id, TimerKind::Retransmission, now + rto);
        }
        self.emit(segment);
    }

    fn send_reset(&mut self, seq: u32) {
        let (src, dst) = (self.quad.local.port(), self.quad.remote.port());
        let mut reset = Segment::new(src, dst, seq, 0, TcpFlags::RST);
        reset.window = 0;
        self.outgoing.push_back(reset);
    }

    /// Segment queued data and FIN as the peer's window allows
    fn flush(&mut self, now: Instant, timers: &mut TimerScheduler) {
        if matches!(
            self.state,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::LastAck
        ) {
            while !self.send_buffer.is_empty() {
                let in_flight = seq::distance(self.snd.una, self.snd.nxt);
                // A closed window with nothing in flight gets a one-byte probe
                let probe = self.snd.wnd == 0 && in_flight == 0;
                let usable = if probe {
                    1
                } else {
                    self.snd.wnd.saturating_sub(in_flight)
                };
                if usable == 0 {
                    break;
                }
                let len = cmp::min(
                    cmp::min(self.mss as usize, usable as usize),
                    self.send_buffer.len(),
                );
                let payload: Vec<u8> = self.send_buffer.drain(..len).collect();
                self.transmit_new(TcpFlags::ACK | TcpFlags::PSH, payload, now, timers);
                if let Some(entry) = self.retransmit.back_mut() {
                    entry.probe = probe;
                }
            }

            if self.fin_requested
                && self.fin_seq.is_none()
                && self.send_buffer.is_empty()
                && matches!(self.state, TcpState::FinWait1 | TcpState::LastAck)
            {
                self.fin_seq = Some(self.snd.nxt);
                self.transmit_new(TcpFlags::FIN | TcpFlags::ACK, Vec::new(), now, timers);
            }
        }

        if self.ack_pending && !matches!(self.state, TcpState::SynSent | TcpState::Closed) {
            let ack = self.segment(self.snd.nxt, TcpFlags::ACK, Vec::new());
            self.emit(ack);
        }
        self.ack_pending = false;
    }

    fn transition(&mut self, to: TcpState, now: Instant, timers: &mut TimerScheduler) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        match to {
            TcpState::Established => {
                if let Some(keepalive) = self.config.keepalive {
                    self.timers.keepalive.arm(
                        timers,
                        self.id,
                        TimerKind::Keepalive,
                        self.last_activity + keepalive.idle,
                    );
                }
            }
            TcpState::FinWait2 => {
                self.timers.fin_wait2.arm(
                    timers,
                    self.id,
                    TimerKind::FinWait2,
                    self.last_activity + self.config.fin_wait2_timeout,
                );
            }
            TcpState::TimeWait => {
                self.retransmit.clear();
                self.timers.retransmission.disarm();
                self.timers.keepalive.disarm();
                self.timers.fin_wait2.disarm();
                self.timers
                    .time_wait
                    .arm(timers, self.id, TimerKind::TimeWait, now + self.config.time_wait);
            }
            _ => {}
        }
    }

    fn terminate(&mut self, reason: CloseReason) {
        debug!("[{}] {:?} -> Closed ({:?})", self.id, self.state, reason);
        self.state = TcpState::Closed;
        self.close_reason = Some(reason);
        self.send_buffer.clear();
        self.retransmit.clear();
        self.recv_buffer.clear();
        self.out_of_order.clear();
        self.out_of_order_bytes = 0;
        self.timers.disarm_all();
    }

    /// Handle a due timer entry addressed to this connection
    pub fn on_timer(
        &mut self,
        entry: &TimerEntry,
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> TimerOutcome {
        if self.state == TcpState::Closed || !self.timers.slot(entry.kind).fire(entry) {
            return TimerOutcome::Stale;
        }

        match entry.kind {
            TimerKind::Retransmission => self.on_retransmission_timeout(now, timers),
            TimerKind::TimeWait => {
                if self.state == TcpState::TimeWait {
                    self.terminate(CloseReason::Normal);
                    TimerOutcome::TimeWaitExpired
                } else {
                    TimerOutcome::Idle
                }
            }
            TimerKind::Keepalive => self.on_keepalive_timeout(now, timers),
            TimerKind::FinWait2 => self.on_fin_wait2_timeout(now, timers),
        }
    }

    fn on_fin_wait2_timeout(&mut self, now: Instant, timers: &mut TimerScheduler) -> TimerOutcome {
        if self.state != TcpState::FinWait2 {
            return TimerOutcome::Idle;
        }
        let deadline = self.last_activity + self.config.fin_wait2_timeout;
        if now < deadline {
            self.timers
                .fin_wait2
                .arm(timers, self.id, TimerKind::FinWait2, deadline);
            return TimerOutcome::Idle;
        }
        debug!("[{}] (FinWait2) no FIN from peer, giving up", self.id);
        self.terminate(CloseReason::Normal);
        TimerOutcome::FinWait2Expired
    }

    fn on_retransmission_timeout(
        &mut self,
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> TimerOutcome {
        let Some(front) = self.retransmit.front_mut() else {
            return TimerOutcome::Idle;
        };

        if front.retries >= self.config.max_retries {
            warn!(
                "[{}] ({:?}) seq={} unacknowledged after {} retries, aborting",
                self.id, self.state, front.seq, self.config.max_retries
            );
            if self.state != TcpState::SynSent {
                self.send_reset(self.snd.nxt);
            }
            self.terminate(CloseReason::TimedOut);
            return TimerOutcome::Aborted;
        }

        front.transmissions += 1;
        front.retries += 1;
        front.sent_at = now;
        let (seq, flags, payload) = (front.seq, front.flags, front.payload.clone());

        self.backoff = self.backoff.saturating_add(1);
        let rto = self.rtt.backed_off(self.backoff);
        debug!(
            "[{}] ({:?}) retransmitting seq={} len={} (rto {:?})",
            self.id,
            self.state,
            seq,
            payload.len(),
            rto
        );
        self.timers
            .retransmission
            .arm(timers, self.id, TimerKind::Retransmission, now + rto);

        let segment = self.segment(seq, flags, payload);
        self.emit(segment);
        TimerOutcome::Retransmitted
    }

    fn on_keepalive_timeout(&mut self, now: Instant, timers: &mut TimerScheduler) -> TimerOutcome {
        let Some(keepalive) = self.config.keepalive else {
            return TimerOutcome::Idle;
        };
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return TimerOutcome::Idle;
        }

        let idle_for = now.saturating_duration_since(self.last_activity);
        if self.keepalive_probes == 0 && idle_for < keepalive.idle {
            self.timers.keepalive.arm(
                timers,
                self.id,
                TimerKind::Keepalive,
                self.last_activity + keepalive.idle,
            );
            return TimerOutcome::Idle;
        }

        if self.keepalive_probes >= keepalive.probes {
            warn!("[{}] keepalive unanswered after {} probes", self.id, self.keepalive_probes);
            self.send_reset(self.snd.nxt);
            self.terminate(CloseReason::TimedOut);
            return TimerOutcome::Aborted;
        }

        self.keepalive_probes += 1;
        let probe = self.segment(self.snd.una.wrapping_sub(1), TcpFlags::ACK, Vec::new());
        self.outgoing.push_back(probe);
        self.timers
            .keepalive
            .arm(timers, self.id, TimerKind::Keepalive, now + keepalive.interval);
        TimerOutcome::KeepaliveProbe
    }

    /// The error a closed connection reports, or NotConnected
    fn closed_error(&self) -> Error {
        self.close_reason
            .and_then(|reason| reason.as_error())
            .unwrap_or(Error::NotConnected)
    }

    /// Queue application bytes for transmission
    ///
    /// Returns how many bytes were accepted, which is zero when the send
    /// buffer is full.
    pub fn write(
        &mut self,
        data: &[u8],
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> Result<usize> {
        match self.state {
            TcpState::Closed => return Err(self.closed_error()),
            TcpState::Listen => return Err(Error::NotConnected),
            _ if self.fin_requested => return Err(Error::ConnectionClosing),
            TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::Established
            | TcpState::CloseWait => {}
            _ => return Err(Error::ConnectionClosing),
        }

        let unacked: usize = self.retransmit.iter().map(|e| e.payload.len()).sum();
        let room = self
            .config
            .send_buffer
            .saturating_sub(self.send_buffer.len() + unacked);
        let accepted = cmp::min(room, data.len());
        self.send_buffer.extend(&data[..accepted]);
        self.flush(now, timers);
        Ok(accepted)
    }

    /// Move received bytes into `buf`
    ///
    /// `Ok(0)` means the peer has closed and everything was read.
    pub fn read(
        &mut self,
        buf: &mut [u8],
        now: Instant,
        timers: &mut TimerScheduler,
    ) -> Result<usize> {
        if self.state == TcpState::Closed {
            return Err(self.closed_error());
        }

        if self.recv_buffer.is_empty() {
            if self.peer_fin {
                return Ok(0);
            }
            return Err(Error::WouldBlock);
        }

        let nread = cmp::min(buf.len(), self.recv_buffer.len());
        for (dst, byte) in buf.iter_mut().zip(self.recv_buffer.drain(..nread)) {
            *dst = byte;
        }

        // Reopen a window that had shrunk below one segment
        if (self.last_advertised as usize) < self.mss as usize
            && self.recv_window() >= self.mss as u32
            && self.state.is_synchronized()
        {
            self.ack_pending = true;
            self.flush(now, timers);
        }

        Ok(nread)
    }

    /// Local close: send FIN once queued data is out
    pub fn close(&mut self, now: Instant, timers: &mut TimerScheduler) -> Result<()> {
        match self.state {
            TcpState::Closed => return Err(self.closed_error()),
            TcpState::Listen | TcpState::SynSent => {
                self.terminate(CloseReason::Normal);
                return Ok(());
            }
            TcpState::SynReceived | TcpState::Established => {
                self.fin_requested = true;
                self.transition(TcpState::FinWait1, now, timers);
            }
            TcpState::CloseWait => {
                self.fin_requested = true;
                self.transition(TcpState::LastAck, now, timers);
            }
            // Already closing
            _ => return Ok(()),
        }
        self.flush(now, timers);
        Ok(())
    }

    /// Local abort: reset the peer and drop everything
    pub fn abort(&mut self) {
        if self.state == TcpState::Closed {
            return;
        }
        if !matches!(self.state, TcpState::SynSent | TcpState::Listen) {
            self.send_reset(self.snd.nxt);
        }
        self.terminate(CloseReason::Aborted);
    }
}
