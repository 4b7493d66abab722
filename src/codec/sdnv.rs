//! Self-Delimiting Numeric Values, the varint of RFC 5050: big-endian
//! 7-bit groups, high bit set on every byte but the last.

use crate::{Error, Result};

/// Longest encoding of a u64 (10 groups of 7 bits).
pub const MAX_SDNV_LEN: usize = 10;

pub fn encoded_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    (70 - value.leading_zeros() as usize) / 7
}

pub fn encode(value: u64, out: &mut Vec<u8>) {
    let len = encoded_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (7 * i)) & 0x7f) as u8;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
}

/// Decodes one SDNV, returning the value and its encoded length.
pub fn decode(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_SDNV_LEN {
            return Err(Error::Corrupt("sdnv exceeds 10 bytes"));
        }
        if value >> 57 != 0 {
            return Err(Error::Corrupt("sdnv overflows u64"));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::Corrupt("truncated sdnv"))
}
