//! TCP (Transmission Control Protocol) segment codec
//!
//! This module provides TCP header parsing and serialization, option
//! handling, and the pseudo-header checksum.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::error::DecodeError;
use crate::network::{fold, sum_words};
use crate::network::{protocol, Datagram};

pub const TCP_HEADER_LEN: usize = 20;
const MAX_OPTIONS_LEN: usize = 40;

/// MSS assumed for a peer that sends no MSS option (RFC 1122 4.2.2.6)
pub const DEFAULT_PEER_MSS: u16 = 536;

bitflags! {
    /// TCP control flags, low byte of the offset/flags word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// TCP packet header structure
///
/// Represents the fixed 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (4 bits) + Flags (8 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Parse TCP header from byte slice
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < TCP_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }

        Ok(TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            data_offset_and_flags: BigEndian::read_u16(&data[12..14]),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
        })
    }

    /// Convert TCP header to bytes
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u32(&mut bytes[4..8], self.seq_number);
        BigEndian::write_u32(&mut bytes[8..12], self.ack_number);
        BigEndian::write_u16(&mut bytes[12..14], self.data_offset_and_flags);
        BigEndian::write_u16(&mut bytes[14..16], self.window_size);
        BigEndian::write_u16(&mut bytes[16..18], self.checksum);
        BigEndian::write_u16(&mut bytes[18..20], self.urgent_ptr);
        bytes
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.data_offset_and_flags as u8)
    }

    /// Set data offset (in bytes) and flags together
    pub fn set_offset_and_flags(&mut self, data_offset: usize, flags: TcpFlags) {
        self.data_offset_and_flags = (((data_offset / 4) as u16) << 12) | flags.bits() as u16;
    }
}

/// Options understood by the codec; anything else is skipped on decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamps { value: u32, echo: u32 },
}

mod option_kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const TIMESTAMPS: u8 = 8;
}

/// Parse the options area of a TCP header
pub fn parse_options(mut data: &[u8]) -> Result<Vec<TcpOption>, DecodeError> {
    let mut options = Vec::new();

    while let Some(&kind) = data.first() {
        match kind {
            option_kind::END => break,
            option_kind::NOP => {
                data = &data[1..];
                continue;
            }
            _ => {}
        }

        let len = *data.get(1).ok_or(DecodeError::BadOption { kind, len: 0 })?;
        if len < 2 || len as usize > data.len() {
            return Err(DecodeError::BadOption { kind, len });
        }
        let body = &data[2..len as usize];
        let expect = |want: u8| {
            if len == want {
                Ok(())
            } else {
                Err(DecodeError::BadOption { kind, len })
            }
        };

        match kind {
            option_kind::MSS => {
                expect(4)?;
                options.push(TcpOption::MaxSegmentSize(BigEndian::read_u16(body)));
            }
            option_kind::WINDOW_SCALE => {
                expect(3)?;
                options.push(TcpOption::WindowScale(body[0]));
            }
            option_kind::SACK_PERMITTED => {
                expect(2)?;
                options.push(TcpOption::SackPermitted);
            }
            option_kind::TIMESTAMPS => {
                expect(10)?;
                options.push(TcpOption::Timestamps {
                    value: BigEndian::read_u32(&body[0..4]),
                    echo: BigEndian::read_u32(&body[4..8]),
                });
            }
            // Unknown kinds are skipped by their declared length
            _ => {}
        }

        data = &data[len as usize..];
    }

    Ok(options)
}

/// Serialize options, padded with NOPs to a 4-byte boundary
pub fn write_options(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        match *option {
            TcpOption::MaxSegmentSize(mss) => {
                out.extend_from_slice(&[option_kind::MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.extend_from_slice(&[option_kind::WINDOW_SCALE, 3, shift]);
            }
            TcpOption::SackPermitted => {
                out.extend_from_slice(&[option_kind::SACK_PERMITTED, 2]);
            }
            TcpOption::Timestamps { value, echo } => {
                out.extend_from_slice(&[option_kind::TIMESTAMPS, 10]);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo.to_be_bytes());
            }
        }
    }
    while out.len() % 4 != 0 {
        out.insert(0, option_kind::NOP);
    }
    out.truncate(MAX_OPTIONS_LEN);
    out
}

/// Checksum over the IPv4 pseudo-header followed by the whole segment
///
/// Returns zero when run over a segment whose checksum field is intact.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    // src_ip(4) + dst_ip(4) + zero(1) + protocol(1) + tcp_len(2) = 12 bytes
    let mut pseudo_header = [0u8; 12];
    pseudo_header[0..4].copy_from_slice(&src.octets());
    pseudo_header[4..8].copy_from_slice(&dst.octets());
    pseudo_header[9] = protocol::TCP;
    BigEndian::write_u16(&mut pseudo_header[10..12], segment.len() as u16);

    fold(sum_words(segment, sum_words(&pseudo_header, 0)))
}

/// A decoded TCP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Segment {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window: 0,
            urgent: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Sequence space consumed: payload bytes plus one each for SYN and FIN
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|option| match option {
            TcpOption::MaxSegmentSize(mss) => Some(*mss),
            _ => None,
        })
    }

    /// Decode the TCP segment carried by `datagram`
    pub fn decode(datagram: &Datagram) -> Result<Self, DecodeError> {
        let data = &datagram.payload;
        let header = TcpHeader::from_bytes(data)?;

        let offset = header.data_offset();
        if offset < TCP_HEADER_LEN || offset > data.len() {
            return Err(DecodeError::Truncated);
        }

        if tcp_checksum(datagram.src, datagram.dst, data) != 0 {
            return Err(DecodeError::ChecksumMismatch);
        }

        Ok(Segment {
            src_port: header.src_port,
            dst_port: header.dst_port,
            seq: header.seq_number,
            ack: header.ack_number,
            flags: header.flags(),
            window: header.window_size,
            urgent: header.urgent_ptr,
            options: parse_options(&data[TCP_HEADER_LEN..offset])?,
            payload: data[offset..].to_vec(),
        })
    }

    /// Serialize into a datagram from `src` to `dst`
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Datagram {
        let options = write_options(&self.options);
        let offset = TCP_HEADER_LEN + options.len();

        let mut header = TcpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq_number: self.seq,
            ack_number: self.ack,
            data_offset_and_flags: 0,
            window_size: self.window,
            checksum: 0,
            urgent_ptr: self.urgent,
        };
        header.set_offset_and_flags(offset, self.flags);

        let mut bytes = Vec::with_capacity(offset + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&options);
        bytes.extend_from_slice(&self.payload);

        let sum = tcp_checksum(src, dst, &bytes);
        BigEndian::write_u16(&mut bytes[16..18], sum);

        Datagram::new(protocol::TCP, src, dst, bytes)
    }
}
