//! Single-threaded event loop
//!
//! Each turn handles exactly one event to completion: a due timer, or one
//! datagram read from the channel. The only blocking point is the wait for
//! the channel to become readable, bounded by the next timer deadline.

use std::io;
use std::time::Instant;

use tracing::{trace, warn};

use crate::error::Result;
use crate::iface::device::PacketChannel;
use crate::iface::interface::NetworkInterface;

/// Largest datagram read from the channel
pub const MTU: usize = 1504;

/// What one turn of the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A datagram of this many bytes was processed
    Datagram(usize),
    /// A timer fired
    Timer,
    /// The wait ended with nothing to do
    Idle,
}

pub struct EventLoop<C> {
    channel: C,
    iface: NetworkInterface,
    buf: Vec<u8>,
}

impl<C: PacketChannel> EventLoop<C> {
    pub fn new(channel: C, iface: NetworkInterface) -> Self {
        EventLoop {
            channel,
            iface,
            buf: vec![0u8; MTU],
        }
    }

    pub fn iface(&self) -> &NetworkInterface {
        &self.iface
    }

    pub fn iface_mut(&mut self) -> &mut NetworkInterface {
        &mut self.iface
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Wait for and process one event, then write out queued datagrams
    pub fn turn(&mut self) -> Result<Event> {
        let now = Instant::now();
        let event = if self.iface.fire_next_timer(now) {
            Event::Timer
        } else {
            let timeout = self
                .iface
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now));
            if self.channel.wait_readable(timeout)? {
                self.receive(Instant::now())?
            } else if self.iface.fire_next_timer(Instant::now()) {
                Event::Timer
            } else {
                Event::Idle
            }
        };
        self.flush_output();
        Ok(event)
    }

    fn receive(&mut self, now: Instant) -> Result<Event> {
        match self.channel.recv(&mut self.buf) {
            Ok(nbytes) => {
                trace!("received {nbytes} bytes");
                self.iface.process_packet(&self.buf[..nbytes], now);
                Ok(Event::Datagram(nbytes))
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Event::Idle)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write every queued datagram to the channel
    ///
    /// A failed write loses that datagram only; retransmission covers it.
    pub fn flush_output(&mut self) {
        while let Some(packet) = self.iface.dequeue_output() {
            if let Err(err) = self.channel.send(&packet) {
                warn!("failed to send {} byte datagram: {err}", packet.len());
            }
        }
    }

    /// Run forever, giving `app` the interface after every event
    ///
    /// Returns only when the channel fails.
    pub fn run<F>(&mut self, mut app: F) -> Result<()>
    where
        F: FnMut(&mut NetworkInterface),
    {
        loop {
            self.turn()?;
            app(&mut self.iface);
            self.flush_output();
        }
    }
}
