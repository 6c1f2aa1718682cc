//! Per-pivot message buffer
//!
//! An ordered, last-write-wins set of pending mutations, unique by key.
//! The buffer carries a running byte counter over encoded entry sizes; the
//! node compares that counter against `max_pivot_msg_bytes` to decide when
//! to cascade.
//!
//! Every operation takes the buffer's own mutex. Multi-step transfers
//! (`drain_with`, `split_upper_half`) hold it for their whole critical
//! section so a concurrent reader blocked on `find` can never observe
//! entries mid-move between a parent and a child buffer.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::codec;
use crate::error::Result;
use crate::msg::Msg;

// Fixed serialized header: the u32 entry count.
const HEADER_BYTES: usize = 4;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Bytes, Msg>,
    bytes: usize,
}

impl Inner {
    fn recount(&mut self) {
        self.bytes = self.entries.values().map(Msg::encoded_size).sum();
    }
}

/// Ordered buffer of pending mutations for one pivot
#[derive(Default)]
pub struct MsgBuf {
    inner: Mutex<Inner>,
}

/// Result of halving a buffer at its ordinal middle
pub struct BufSplit {
    /// Smallest key the buffer held before the split; the caller re-locks
    /// the root-to-leaf path for this key afterwards
    pub first_key: Bytes,

    /// Separator for the new pivot: first key of the upper half
    pub middle_key: Bytes,

    /// Upper half of the entries, ready to become a sibling pivot's buffer
    pub upper: MsgBuf,
}

impl MsgBuf {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_entries(entries: BTreeMap<Bytes, Msg>) -> Self {
        let mut inner = Inner {
            entries,
            bytes: 0,
        };
        inner.recount();
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Number of buffered entries
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Approximate serialized footprint: header + encoded entries.
    /// A sizing heuristic, not an exact byte count.
    pub fn size(&self) -> usize {
        HEADER_BYTES + self.inner.lock().bytes
    }

    /// Insert a message, replacing any prior entry with the same key
    /// (last write wins) and adjusting the byte counter by the delta
    pub fn insert(&self, msg: Msg) {
        let mut inner = self.inner.lock();
        inner.bytes += msg.encoded_size();
        if let Some(prior) = inner.entries.insert(msg.key().clone(), msg) {
            inner.bytes -= prior.encoded_size();
        }
    }

    /// Most recent Put/Del buffered for `key`, if any
    pub fn find(&self, key: &[u8]) -> Option<Msg> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Drop all entries; the buffer object survives, emptied
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Drain every entry, in ascending key order, through `f`. The buffer
    /// lock is held across all callbacks so the drain is atomic from the
    /// point of view of concurrent `find`s.
    pub fn drain_with(&self, mut f: impl FnMut(Msg)) {
        let mut inner = self.inner.lock();
        for (_, msg) in std::mem::take(&mut inner.entries) {
            f(msg);
        }
        inner.bytes = 0;
    }

    /// Split at the ordinal middle: entries from position `count / 2`
    /// onward move into a fresh buffer, this one keeps the lower half.
    /// Returns `None` when there are fewer than two entries — a single
    /// oversized entry cannot be halved.
    pub fn split_upper_half(&self) -> Option<BufSplit> {
        let mut inner = self.inner.lock();
        if inner.entries.len() < 2 {
            return None;
        }

        let first_key = inner.entries.keys().next().cloned()?;
        let middle_key = inner.entries.keys().nth(inner.entries.len() / 2).cloned()?;
        let upper = inner.entries.split_off(&middle_key);
        inner.recount();

        Some(BufSplit {
            first_key,
            middle_key,
            upper: MsgBuf::from_entries(upper),
        })
    }

    /// Serialize as `count` followed by each entry in ascending key order
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let inner = self.inner.lock();
        dst.put_u32_le(inner.entries.len() as u32);
        for msg in inner.entries.values() {
            msg.encode(dst);
        }
    }

    pub(crate) fn decode(src: &mut &[u8]) -> Result<MsgBuf> {
        let count = codec::get_u32(src)?;
        let buf = MsgBuf::new();
        for _ in 0..count {
            buf.insert(Msg::decode(src)?);
        }
        Ok(buf)
    }
}

impl std::fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MsgBuf")
            .field("count", &inner.entries.len())
            .field("bytes", &inner.bytes)
            .finish()
    }
}
