//! Wire codec helpers
//!
//! Checked cursor-style reads over a byte slice. Encoding goes through
//! `bytes::BufMut` directly; decoding uses these helpers so a truncated or
//! mangled node image surfaces as `Corruption` instead of a panic.
//!
//! All fixed-width integers are little-endian.

use bytes::Bytes;

use crate::error::{CascadeError, Result};

/// Advance the cursor past `n` bytes and return them
pub(crate) fn take<'a>(src: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if src.len() < n {
        return Err(CascadeError::Corruption(format!(
            "truncated input: need {} bytes, have {}",
            n,
            src.len()
        )));
    }
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

pub(crate) fn get_u8(src: &mut &[u8]) -> Result<u8> {
    Ok(take(src, 1)?[0])
}

pub(crate) fn get_u32(src: &mut &[u8]) -> Result<u32> {
    let b = take(src, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a `u32` length prefix followed by that many bytes
pub(crate) fn get_len_prefixed(src: &mut &[u8]) -> Result<Bytes> {
    let len = get_u32(src)? as usize;
    Ok(Bytes::copy_from_slice(take(src, len)?))
}
