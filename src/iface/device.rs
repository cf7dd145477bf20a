//! Packet channel to the virtual interface
//!
//! The engine reads and writes whole IP datagrams and knows nothing of the
//! device behind them. [`tun_tap::Iface`] is the real channel; the in-memory
//! one backs tests.

use std::cmp;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tun_tap::Iface;

/// Bidirectional datagram channel
pub trait PacketChannel {
    /// Read one datagram into `buf`
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one datagram
    fn send(&mut self, packet: &[u8]) -> io::Result<usize>;

    /// Block until a datagram can be read or `timeout` elapses
    ///
    /// `None` waits indefinitely. Returns whether the channel is readable.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;
}

impl PacketChannel for Iface {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Iface::recv(self, buf)
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        Iface::send(self, packet)
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }
}

/// Millisecond timeout for poll(2), rounded up so a deadline is never early
fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let ms = timeout.as_nanos().div_ceil(1_000_000);
            cmp::min(ms, libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Wait for `fd` to become readable
///
/// A signal interrupting the wait counts as a timeout.
pub fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}

/// In-memory channel: injected datagrams are read back in order, sent
/// datagrams are collected. Waiting never blocks.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram as if it arrived from the interface
    pub fn inject(&mut self, packet: Vec<u8>) {
        self.inbound.push_back(packet);
    }

    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Take everything written so far
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl PacketChannel for MemoryChannel {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        // Oversized datagrams are truncated like a short read from the device
        let len = cmp::min(buf.len(), packet.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.sent.push(packet.to_vec());
        Ok(packet.len())
    }

    fn wait_readable(&mut self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(!self.inbound.is_empty())
    }
}
