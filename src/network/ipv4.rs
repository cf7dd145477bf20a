//! IPv4 protocol implementation
//!
//! This module provides IPv4 datagram parsing, validation, and serialization.
//!
//! Features:
//! - IPv4 header parsing and serialization
//! - Checksum calculation and validation
//! - Rejection of fragments (no reassembly)
//! - Process-wide identification counter for outbound datagrams

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::DecodeError;
use crate::network::checksum;
use byteorder::{BigEndian, ByteOrder};

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
pub const DEFAULT_TTL: u8 = 64;

static NEXT_IDENTIFICATION: AtomicU16 = AtomicU16::new(1);

/// Take the next identification value for an outbound datagram.
pub fn next_identification() -> u16 {
    NEXT_IDENTIFICATION.fetch_add(1, Ordering::Relaxed)
}

/// IPv4 packet header structure
///
/// Represents the fixed 20-byte part of the IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: [u8; 4], // Source IP Address
    pub dst_addr: [u8; 4], // Destination IP Address
}

impl Ipv4Header {
    /// Parse the fixed IPv4 header from a byte slice
    ///
    /// Only the version and the minimum length are checked here; see
    /// [`Ipv4Header::validate`] for the rest.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != IPV4_VERSION {
            return Err(DecodeError::BadVersion(version));
        }

        let mut src_addr = [0u8; 4];
        let mut dst_addr = [0u8; 4];
        src_addr.copy_from_slice(&data[12..16]);
        dst_addr.copy_from_slice(&data[16..20]);

        Ok(Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr,
            dst_addr,
        })
    }

    /// Convert IPv4 header to bytes
    ///
    /// Serializes the fixed header; options, if any, follow it on the wire.
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (self.version << 4) | self.ihl;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src_addr);
        bytes[16..20].copy_from_slice(&self.dst_addr);

        bytes
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// True if this datagram is any fragment of a larger one
    pub fn is_fragment(&self) -> bool {
        self.flags_frag_offset & flags::MORE_FRAGMENTS != 0
            || self.flags_frag_offset & flags::FRAGMENT_OFFSET_MASK != 0
    }

    /// Validate the header against the bytes it was read from
    ///
    /// `raw` must start at the header. Checks header length, total length,
    /// fragmentation and the header checksum.
    pub fn validate(&self, raw: &[u8]) -> Result<(), DecodeError> {
        // Check IHL (minimum 5 for 20-byte header)
        if self.ihl < DEFAULT_IHL {
            return Err(DecodeError::BadHeaderLength);
        }
        if self.header_len() > raw.len() {
            return Err(DecodeError::Truncated);
        }

        // Check total length
        if (self.total_len as usize) < self.header_len() {
            return Err(DecodeError::BadHeaderLength);
        }
        if self.total_len as usize > raw.len() {
            return Err(DecodeError::LengthExceedsBuffer {
                declared: self.total_len as usize,
                actual: raw.len(),
            });
        }

        // Summing a header including its checksum yields zero when intact
        if checksum(&raw[..self.header_len()]) != 0 {
            return Err(DecodeError::HeaderChecksum);
        }

        if self.is_fragment() {
            return Err(DecodeError::Fragmented);
        }

        Ok(())
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

/// A decoded IPv4 datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub tos: u8,
    pub flags_frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Raw header options, a multiple of four bytes
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
    /// Total length as declared by the header it was decoded from
    pub total_len: u16,
}

impl Datagram {
    /// Build an outbound datagram with default TTL and the DF bit set
    pub fn new(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: Vec<u8>) -> Self {
        let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
        Datagram {
            tos: 0,
            flags_frag_offset: flags::DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol,
            src,
            dst,
            options: Vec::new(),
            payload,
            total_len,
        }
    }

    /// Parse and validate a datagram
    ///
    /// Bytes past the declared total length are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let header = Ipv4Header::from_bytes(data)?;
        header.validate(data)?;

        let header_len = header.header_len();
        Ok(Datagram {
            tos: header.tos,
            flags_frag_offset: header.flags_frag_offset,
            ttl: header.ttl,
            protocol: header.protocol,
            src: Ipv4Addr::from(header.src_addr),
            dst: Ipv4Addr::from(header.dst_addr),
            options: data[IPV4_HEADER_LEN..header_len].to_vec(),
            payload: data[header_len..header.total_len as usize].to_vec(),
            total_len: header.total_len,
        })
    }

    /// Serialize with a fresh identification and recomputed checksum
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_id(next_identification())
    }

    /// Serialize using an explicit identification value
    pub fn encode_with_id(&self, id: u16) -> Vec<u8> {
        let header_len = IPV4_HEADER_LEN + self.options.len();
        let total_len = header_len + self.payload.len();

        let mut header = Ipv4Header {
            version: IPV4_VERSION,
            ihl: (header_len / 4) as u8,
            tos: self.tos,
            total_len: total_len as u16,
            id,
            flags_frag_offset: self.flags_frag_offset,
            ttl: self.ttl,
            protocol: self.protocol,
            checksum: 0,
            src_addr: self.src.octets(),
            dst_addr: self.dst.octets(),
        };

        let mut packet = Vec::with_capacity(total_len);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(&self.options);
        header.checksum = checksum(&packet[..header_len]);
        BigEndian::write_u16(&mut packet[10..12], header.checksum);
        packet.extend_from_slice(&self.payload);
        packet
    }
}
