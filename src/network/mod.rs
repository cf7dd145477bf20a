//! Network layer protocols implementation
//!
//! This module contains the IPv4 layer and the Internet checksum shared
//! with the transport layer.

pub mod ipv4;

// Re-export commonly used items
pub use ipv4::{flags, protocol, Datagram, Ipv4Header};

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// This is used for both IP and TCP checksums.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Add `data` to a running one's complement sum without folding.
///
/// Lets callers checksum discontiguous buffers (a pseudo-header followed by
/// a segment) without copying them together.
pub fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;

    // Process data in 2-byte chunks
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }

    // Handle odd-length data by padding with zero
    if let [last_byte] = chunks.remainder() {
        sum = sum.wrapping_add((*last_byte as u32) << 8);
    }

    // Keep the accumulator well away from overflow on large inputs
    while (sum >> 16) > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum
}

/// Fold carries into the low 16 bits and return the one's complement.
pub fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // RFC 1071 section 3 worked example: sum is 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2u16);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0x12]), !0x1200u16);
    }

    #[test]
    fn test_split_sum_matches_contiguous() {
        let a = [0x45, 0x00, 0x00, 0x3c, 0x1c];
        let b = [0x46, 0x40, 0x00];
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        // Only even-length prefixes can be split without re-alignment.
        let split = fold(sum_words(&joined[4..], sum_words(&joined[..4], 0)));
        assert_eq!(split, checksum(&joined));
    }
}
