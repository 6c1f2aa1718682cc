//! Message Module
//!
//! A `Msg` is one pending mutation — a put or a delete — waiting in some
//! pivot's buffer on its way down the tree. Keys and values are immutable
//! byte strings (`bytes::Bytes`), so a message can move between buffers
//! without copying payload bytes, and the tree never aliases caller-owned
//! mutable memory: caller slices are deep-copied once at the API boundary.

mod buffer;

pub use buffer::{BufSplit, MsgBuf};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::{CascadeError, Result};

// Wire tags. 0 is reserved (historic Nop) and never produced.
const TAG_PUT: u8 = 1;
const TAG_DEL: u8 = 2;

/// A single pending mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Store `value` under `key`
    Put { key: Bytes, value: Bytes },

    /// Remove `key` (a tombstone until it reaches the leaf level)
    Del { key: Bytes },
}

impl Msg {
    pub fn key(&self) -> &Bytes {
        match self {
            Msg::Put { key, .. } => key,
            Msg::Del { key } => key,
        }
    }

    /// Encoded footprint of this message: tag + length-prefixed key
    /// (+ length-prefixed value for puts). Drives the buffer threshold.
    pub fn encoded_size(&self) -> usize {
        match self {
            Msg::Put { key, value } => 1 + 4 + key.len() + 4 + value.len(),
            Msg::Del { key } => 1 + 4 + key.len(),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        match self {
            Msg::Put { key, value } => {
                dst.put_u8(TAG_PUT);
                dst.put_u32_le(key.len() as u32);
                dst.put_slice(key);
                dst.put_u32_le(value.len() as u32);
                dst.put_slice(value);
            }
            Msg::Del { key } => {
                dst.put_u8(TAG_DEL);
                dst.put_u32_le(key.len() as u32);
                dst.put_slice(key);
            }
        }
    }

    pub(crate) fn decode(src: &mut &[u8]) -> Result<Msg> {
        let tag = codec::get_u8(src)?;
        let key = codec::get_len_prefixed(src)?;
        match tag {
            TAG_PUT => {
                let value = codec::get_len_prefixed(src)?;
                Ok(Msg::Put { key, value })
            }
            TAG_DEL => Ok(Msg::Del { key }),
            other => Err(CascadeError::Corruption(format!(
                "unknown message tag {other}"
            ))),
        }
    }
}
