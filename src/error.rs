//! Error types for the codecs and the engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a datagram or segment is rejected by the codecs.
///
/// These are never surfaced to a connection; the interface counts them and
/// drops the input.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short")]
    Truncated,

    #[error("unsupported IP version {0}")]
    BadVersion(u8),

    #[error("invalid header length")]
    BadHeaderLength,

    #[error("declared length {declared} exceeds {actual} bytes read")]
    LengthExceedsBuffer { declared: usize, actual: usize },

    #[error("IPv4 header checksum mismatch")]
    HeaderChecksum,

    #[error("fragmented datagram")]
    Fragmented,

    #[error("TCP checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid length {len} for TCP option kind {kind}")]
    BadOption { kind: u8, len: u8 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection table or buffer capacity exhausted")]
    ResourceExhausted,

    #[error("Port {0} already in use")]
    AddrInUse(u16),

    #[error("Unknown connection handle")]
    InvalidHandle,

    #[error("Connection not established")]
    NotConnected,

    #[error("Connection closing")]
    ConnectionClosing,

    #[error("Operation would block")]
    WouldBlock,
}
