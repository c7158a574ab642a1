//! Variable-length integers, the only integer representation on the wire.
//!
//! Values are treated as 32-bit two's complement, sent most significant
//! 7-bit group first with bit 7 marking continuation. A first byte with
//! bits 5 and 6 both set starts a negative value.

use bytes::BufMut;

use crate::error::{FrameError, Result};

/// Longest encoding of a 32-bit value.
pub const MAX_ENCODED_LEN: usize = 5;

/// Number of bytes [`encode`] will produce for `value`.
pub fn encoded_len(value: i32) -> usize {
    let v = i64::from(value);
    match v {
        v if !(-0x4000000..0xc000000).contains(&v) => 5,
        v if !(-0x80000..0x180000).contains(&v) => 4,
        v if !(-0x1000..0x3000).contains(&v) => 3,
        v if !(-0x20..0x60).contains(&v) => 2,
        _ => 1,
    }
}

/// Append `value` using the minimal number of bytes.
pub fn encode<B: BufMut>(value: i32, dst: &mut B) {
    let len = encoded_len(value);
    for group in (1..len).rev() {
        dst.put_u8(((value >> (7 * group)) & 0x7f) as u8 | 0x80);
    }
    dst.put_u8((value & 0x7f) as u8);
}

/// Append an unsigned value; it shares the signed encoding of its bit pattern.
pub fn encode_u32<B: BufMut>(value: u32, dst: &mut B) {
    encode(value as i32, dst)
}

/// Decode one value starting at `*pos`, advancing `*pos` past it.
///
/// Returns the raw 32-bit pattern; callers choose the signed or unsigned view.
pub fn decode_raw(src: &[u8], pos: &mut usize) -> Result<u32> {
    let start = *pos;
    let mut c = *src.get(*pos).ok_or(FrameError::Truncated { offset: start })?;
    *pos += 1;
    let mut v = u32::from(c & 0x7f);
    if c & 0x60 == 0x60 {
        v |= !0x1f;
    }
    while c & 0x80 != 0 {
        if *pos - start >= MAX_ENCODED_LEN {
            return Err(FrameError::Overlong { offset: start });
        }
        c = *src.get(*pos).ok_or(FrameError::Truncated { offset: start })?;
        *pos += 1;
        v = (v << 7) | u32::from(c & 0x7f);
    }
    Ok(v)
}

/// Decode an unsigned value.
pub fn decode_u32(src: &[u8], pos: &mut usize) -> Result<u32> {
    decode_raw(src, pos)
}

/// Decode a signed value.
pub fn decode_i32(src: &[u8], pos: &mut usize) -> Result<i32> {
    decode_raw(src, pos).map(|v| v as i32)
}
