//! Sequence number arithmetic modulo 2^32 (RFC 793 section 3.3)

/// `a < b` in sequence space
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space
pub fn le(a: u32, b: u32) -> bool {
    a == b || lt(a, b)
}

/// `a > b` in sequence space
pub fn gt(a: u32, b: u32) -> bool {
    lt(b, a)
}

/// `start <= x < end`, with `start..end` allowed to wrap
pub fn in_window(start: u32, x: u32, end: u32) -> bool {
    x.wrapping_sub(start) < end.wrapping_sub(start)
}

/// Number of sequence numbers from `from` up to `to`
pub fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}
