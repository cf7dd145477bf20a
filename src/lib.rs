//! A user-space TCP/IP engine driven over a TUN interface
//!
//! This library provides:
//! - IPv4 datagram decoding, validation and encoding
//! - TCP segment codec with pseudo-header checksums and options
//! - Per-connection TCP state machine with retransmission
//! - Connection table, timers and a single-threaded event loop

pub mod config;
pub mod error;
pub mod iface;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, KeepaliveConfig, TcpConfig};
pub use error::{DecodeError, Error, Result};
pub use iface::{EventLoop, MemoryChannel, NetworkInterface, PacketChannel};
pub use network::ipv4::{Datagram, Ipv4Header};
pub use transport::{ConnectionId, Segment, TcpFlags, TcpState};
