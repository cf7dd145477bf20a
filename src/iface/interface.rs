//! Network interface: datagram dispatch and the application surface
//!
//! This module ties the layers together:
//! - IPv4 reception and validation, dropping anything that is not TCP for us
//! - Demultiplexing segments by 4-tuple, spawning connections from listeners
//! - Closed-port resets and listener admission control
//! - Timer dispatch and reaping of closed connections
//!
//! Nothing here touches the packet channel. Encoded datagrams are queued and
//! the event loop writes them out after each event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::{Config, TcpConfig};
use crate::error::{Error, Result};
use crate::iface::table::ConnectionTable;
use crate::network::ipv4::{protocol, Datagram};
use crate::transport::connection::{
    CloseReason, Connection, ConnectionId, Quad, TcpState, TimerOutcome,
};
use crate::transport::tcp::{Segment, TcpFlags};
use crate::transport::timer::TimerScheduler;

/// First port handed out for active opens (IANA dynamic range)
pub const EPHEMERAL_PORT_START: u16 = 49152;

/// Traffic counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub datagrams_received: u64,
    pub malformed: u64,
    pub non_tcp: u64,
    pub not_for_us: u64,
    pub segments_received: u64,
    pub segments_sent: u64,
    pub resets_sent: u64,
    pub retransmissions: u64,
    pub refused: u64,
}

/// Passive-open template for one port
#[derive(Debug, Default)]
struct Listener {
    /// Handshakes in progress
    pending: HashSet<ConnectionId>,
    /// Established and waiting for `accept`
    ready: VecDeque<ConnectionId>,
}

impl Listener {
    fn queued(&self) -> usize {
        self.pending.len() + self.ready.len()
    }
}

/// Network interface for packet processing
pub struct NetworkInterface {
    local_addr: Ipv4Addr,
    config: TcpConfig,
    connections: ConnectionTable,
    listeners: HashMap<u16, Listener>,
    timers: TimerScheduler,
    /// Failures not yet reported to the application
    failures: HashMap<ConnectionId, CloseReason>,
    output: VecDeque<Vec<u8>>,
    next_ephemeral: u16,
    stats: Stats,
}

impl NetworkInterface {
    pub fn new(local_addr: Ipv4Addr, config: TcpConfig) -> Self {
        NetworkInterface {
            local_addr,
            connections: ConnectionTable::new(config.max_connections),
            config,
            listeners: HashMap::new(),
            timers: TimerScheduler::new(),
            failures: HashMap::new(),
            output: VecDeque::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
            stats: Stats::default(),
        }
    }

    /// Validate `config` and open its listening ports
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let mut iface = NetworkInterface::new(config.local_addr, config.tcp.clone());
        for &port in &config.listen {
            iface.listen(port)?;
        }
        Ok(iface)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Earliest timer deadline, if any timer is pending
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Next encoded datagram waiting to be written to the channel
    pub fn dequeue_output(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Process incoming IPv4 packet
    ///
    /// Malformed input is dropped and counted, never reported.
    pub fn process_packet(&mut self, packet: &[u8], now: Instant) {
        self.stats.datagrams_received += 1;

        let datagram = match Datagram::decode(packet) {
            Ok(datagram) => datagram,
            Err(err) => {
                self.stats.malformed += 1;
                trace!("dropping malformed datagram: {err}");
                return;
            }
        };

        if datagram.dst != self.local_addr {
            self.stats.not_for_us += 1;
            trace!("dropping datagram for {}", datagram.dst);
            return;
        }

        if datagram.protocol != protocol::TCP {
            self.stats.non_tcp += 1;
            trace!("dropping protocol {} datagram from {}", datagram.protocol, datagram.src);
            return;
        }

        let segment = match Segment::decode(&datagram) {
            Ok(segment) => segment,
            Err(err) => {
                self.stats.malformed += 1;
                trace!("dropping segment from {}: {err}", datagram.src);
                return;
            }
        };
        self.stats.segments_received += 1;

        let quad = Quad {
            local: SocketAddrV4::new(self.local_addr, segment.dst_port),
            remote: SocketAddrV4::new(datagram.src, segment.src_port),
        };
        trace!(
            "{quad} seq={} ack={} flags={:?} len={}",
            segment.seq,
            segment.ack,
            segment.flags,
            segment.payload.len()
        );
        self.dispatch_segment(quad, &segment, now);
    }

    fn dispatch_segment(&mut self, quad: Quad, segment: &Segment, now: Instant) {
        if let Some(id) = self.connections.lookup(&quad) {
            if let Some(connection) = self.connections.get_mut(id) {
                connection.on_segment(segment, now, &mut self.timers);
            }
            self.after_event(id);
            return;
        }

        if self.listeners.contains_key(&quad.local.port()) {
            self.on_listen_segment(quad, segment, now);
        } else {
            trace!("{quad} no connection or listener");
            self.reset_unknown(quad, segment);
        }
    }

    /// Segment for a listening port with no connection yet (RFC 793 LISTEN)
    fn on_listen_segment(&mut self, quad: Quad, segment: &Segment, now: Instant) {
        let flags = segment.flags;
        if flags.contains(TcpFlags::RST) {
            return;
        }
        if flags.contains(TcpFlags::ACK) {
            self.reset_unknown(quad, segment);
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            return;
        }

        let port = quad.local.port();
        let backlog_full = self
            .listeners
            .get(&port)
            .is_some_and(|listener| listener.queued() >= self.config.backlog);
        if self.connections.is_full() || backlog_full {
            self.stats.refused += 1;
            warn!("{quad} refusing connection (table or backlog full)");
            self.reset_unknown(quad, segment);
            return;
        }

        let id = self.connections.next_id();
        let iss: u32 = rand::random();
        let connection =
            Connection::accept(id, quad, segment, iss, &self.config, now, &mut self.timers);
        if let Err(err) = self.connections.insert(connection) {
            warn!("{quad} could not open connection: {err}");
            self.timers.cancel_connection(id);
            return;
        }
        if let Some(listener) = self.listeners.get_mut(&port) {
            listener.pending.insert(id);
        }
        self.after_event(id);
    }

    /// Answer a segment that matches no connection
    fn reset_unknown(&mut self, quad: Quad, segment: &Segment) {
        if segment.flags.contains(TcpFlags::RST) {
            return;
        }
        let (local, remote) = (quad.local.port(), quad.remote.port());
        let reset = if segment.flags.contains(TcpFlags::ACK) {
            Segment::new(local, remote, segment.ack, 0, TcpFlags::RST)
        } else {
            let ack = segment.seq.wrapping_add(segment.seq_len());
            Segment::new(local, remote, 0, ack, TcpFlags::RST | TcpFlags::ACK)
        };
        self.queue_segment(quad, &reset);
    }

    fn queue_segment(&mut self, quad: Quad, segment: &Segment) {
        self.stats.segments_sent += 1;
        if segment.flags.contains(TcpFlags::RST) {
            self.stats.resets_sent += 1;
        }
        let datagram = segment.encode(*quad.local.ip(), *quad.remote.ip());
        self.output.push_back(datagram.encode());
    }

    /// Collect a connection's output and settle its bookkeeping
    fn after_event(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let quad = connection.quad();
        let segments: Vec<Segment> = connection.drain_outgoing().collect();
        let state = connection.state();
        let exposed = connection.is_exposed();
        let reason = connection.close_reason();

        for segment in &segments {
            self.queue_segment(quad, segment);
        }

        let port = quad.local.port();
        if state.is_synchronized() {
            if let Some(listener) = self.listeners.get_mut(&port) {
                if listener.pending.remove(&id) {
                    debug!("[{id}] {quad} ready to accept");
                    listener.ready.push_back(id);
                }
            }
        }

        if state == TcpState::Closed {
            self.connections.remove(id);
            self.timers.cancel_connection(id);
            if let Some(listener) = self.listeners.get_mut(&port) {
                listener.pending.remove(&id);
                listener.ready.retain(|ready| *ready != id);
            }
            if let Some(reason) = reason {
                if exposed && reason.as_error().is_some() {
                    self.failures.insert(id, reason);
                }
            }
            debug!("[{id}] {quad} removed ({reason:?})");
        }
    }

    /// Fire the earliest timer due at `now`
    ///
    /// Returns false when nothing was due. An entry for a connection that
    /// no longer exists is consumed without effect.
    pub fn fire_next_timer(&mut self, now: Instant) -> bool {
        let Some(entry) = self.timers.pop_expired(now) else {
            return false;
        };
        match self.connections.get_mut(entry.conn) {
            Some(connection) => {
                let outcome = connection.on_timer(&entry, now, &mut self.timers);
                if outcome == TimerOutcome::Retransmitted {
                    self.stats.retransmissions += 1;
                }
                trace!("[{}] {:?} timer: {:?}", entry.conn, entry.kind, outcome);
                self.after_event(entry.conn);
            }
            None => trace!("[{}] {:?} timer for departed connection", entry.conn, entry.kind),
        }
        true
    }

    /// Open a passive listener on `port`
    pub fn listen(&mut self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::Config("cannot listen on port 0".into()));
        }
        if self.listeners.contains_key(&port) {
            return Err(Error::AddrInUse(port));
        }
        self.listeners.insert(port, Listener::default());
        info!("listening on {}:{port}", self.local_addr);
        Ok(())
    }

    /// Stop listening; connections not yet accepted are reset
    pub fn unlisten(&mut self, port: u16) {
        let Some(listener) = self.listeners.remove(&port) else {
            return;
        };
        for id in listener.pending.into_iter().chain(listener.ready) {
            if let Some(connection) = self.connections.get_mut(id) {
                connection.abort();
            }
            self.after_event(id);
        }
        info!("stopped listening on port {port}");
    }

    /// Next fully established connection on `port`, oldest first
    pub fn accept(&mut self, port: u16) -> Option<ConnectionId> {
        let id = self.listeners.get_mut(&port)?.ready.pop_front()?;
        let connection = self.connections.get_mut(id)?;
        connection.expose();
        debug!("[{id}] accepted on port {port}");
        Some(id)
    }

    /// Active open towards `remote`
    pub fn connect(&mut self, remote: SocketAddrV4, now: Instant) -> Result<ConnectionId> {
        if self.connections.is_full() {
            return Err(Error::ResourceExhausted);
        }
        let local = self.allocate_port(remote)?;
        let quad = Quad {
            local: SocketAddrV4::new(self.local_addr, local),
            remote,
        };

        let id = self.connections.next_id();
        let iss: u32 = rand::random();
        let mut connection =
            Connection::connect(id, quad, iss, &self.config, now, &mut self.timers);
        connection.expose();
        if let Err(err) = self.connections.insert(connection) {
            self.timers.cancel_connection(id);
            return Err(err);
        }
        self.after_event(id);
        Ok(id)
    }

    fn allocate_port(&mut self, remote: SocketAddrV4) -> Result<u16> {
        let range = u16::MAX - EPHEMERAL_PORT_START + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            let quad = Quad {
                local: SocketAddrV4::new(self.local_addr, port),
                remote,
            };
            if !self.listeners.contains_key(&port) && !self.connections.contains_quad(&quad) {
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted)
    }

    /// Run an application request against a live connection
    ///
    /// A failure recorded since the last request is returned once instead.
    fn with_connection<T>(
        &mut self,
        id: ConnectionId,
        request: impl FnOnce(&mut Connection, &mut TimerScheduler) -> Result<T>,
    ) -> Result<T> {
        if let Some(reason) = self.failures.remove(&id) {
            return Err(reason.as_error().unwrap_or(Error::ConnectionReset));
        }
        let Some(connection) = self.connections.get_mut(id) else {
            return Err(Error::InvalidHandle);
        };
        let result = request(connection, &mut self.timers);
        self.after_event(id);
        result
    }

    /// Queue bytes for transmission; may accept fewer than offered
    pub fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<usize> {
        self.with_connection(id, |connection, timers| connection.write(data, now, timers))
    }

    /// Read received bytes; `Ok(0)` marks end of stream
    pub fn recv(&mut self, id: ConnectionId, buf: &mut [u8], now: Instant) -> Result<usize> {
        self.with_connection(id, |connection, timers| connection.read(buf, now, timers))
    }

    pub fn close(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_connection(id, |connection, timers| connection.close(now, timers))
    }

    pub fn abort(&mut self, id: ConnectionId) -> Result<()> {
        self.with_connection(id, |connection, _| {
            connection.abort();
            Ok(())
        })
    }

    pub fn state(&self, id: ConnectionId) -> Option<TcpState> {
        self.connections.get(id).map(|connection| connection.state())
    }
}
