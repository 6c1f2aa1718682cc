//! Tree node and the cascading-write algorithm
//!
//! A node is an ordered list of pivots under a read/write lock. Each pivot
//! routes one key range: an optional child id, the separator (`left_key`)
//! and a buffer of mutations destined for that range. Writes land in the
//! routed pivot's buffer; once a buffer crosses the configured byte
//! threshold the node either pushes it down into the child or, at a leaf,
//! splits the buffer — and buffer splits can escalate into node splits and
//! ultimately a new root.
//!
//! ## Locking
//!
//! The rwlock guards pivot *structure* only; buffer contents are guarded by
//! each buffer's own mutex. Ordinary writes take the write lock on leaves
//! but only a read lock on internal nodes, which pushes contention toward
//! the leaves. Traversal is hand-over-hand: the parent's guard is released
//! as soon as the child's is held. The one exception is [`Node::lock_path`],
//! which retains every write lock from root to leaf while preparing a split.
//!
//! Guards are `Arc`-backed (`parking_lot`'s `arc_lock`), so a guard can
//! outlive the stack frame that took it and the coupling handoff needs no
//! self-referential lifetimes.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use tracing::{debug, trace};

use crate::codec;
use crate::error::{CascadeError, Result};
use crate::msg::{Msg, MsgBuf};
use crate::store::{Nid, NID_NIL};
use crate::tree::path::LockedPath;
use crate::tree::BufferTree;

pub(crate) type PivotsReadGuard = ArcRwLockReadGuard<RawRwLock, Vec<Pivot>>;
pub(crate) type PivotsWriteGuard = ArcRwLockWriteGuard<RawRwLock, Vec<Pivot>>;

/// One routing entry: keys in `[left_key, next pivot's left_key)` belong
/// here, buffered in `buf` until they cascade into `child`
pub(crate) struct Pivot {
    pub child: Option<Nid>,
    pub buf: Arc<MsgBuf>,
    pub left_key: Bytes,
}

impl Pivot {
    /// Routing-only pivot with a fresh, empty buffer
    pub(crate) fn route(child: Nid, left_key: Bytes) -> Self {
        Self {
            child: Some(child),
            buf: Arc::new(MsgBuf::new()),
            left_key,
        }
    }
}

/// Either half of a node's rwlock, depending on who is allowed to mutate
/// structure: writes take the write half on leaves and the read half on
/// internal nodes (whose buffers have their own locks)
pub(crate) enum PivotGuard {
    Read(PivotsReadGuard),
    Write(PivotsWriteGuard),
}

impl Deref for PivotGuard {
    type Target = Vec<Pivot>;

    fn deref(&self) -> &Vec<Pivot> {
        match self {
            PivotGuard::Read(g) => g,
            PivotGuard::Write(g) => g,
        }
    }
}

/// RAII pin: while alive, the cache evictor will not drop the node
pub(crate) struct PinGuard {
    node: Arc<Node>,
}

impl PinGuard {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        node.pins.fetch_add(1, Ordering::AcqRel);
        Self { node }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.node.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Index of the pivot owning `key`: the last pivot whose `left_key <= key`.
/// A key equal to a separator routes to the pivot that owns that separator
/// (the right one). Keys below every separator clamp to pivot 0.
pub(crate) fn find_pivot(pivots: &[Pivot], key: &[u8]) -> usize {
    pivots
        .partition_point(|p| &p.left_key[..] <= key)
        .saturating_sub(1)
}

/// One tree node
pub(crate) struct Node {
    nid: Nid,
    leaf: AtomicBool,
    pivots: Arc<RwLock<Vec<Pivot>>>,
    dirty: AtomicBool,
    flushing: AtomicBool,
    pins: AtomicUsize,
    /// Last footprint computed by [`Node::write_back_size`]
    size_estimate: AtomicUsize,
}

impl Node {
    pub(crate) fn new(nid: Nid, leaf: bool) -> Self {
        Self {
            nid,
            leaf: AtomicBool::new(leaf),
            pivots: Arc::new(RwLock::new(Vec::new())),
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            pins: AtomicUsize::new(0),
            size_estimate: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Flags and identity
    // =========================================================================

    pub(crate) fn nid(&self) -> Nid {
        self.nid
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf.load(Ordering::Acquire)
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// `clean -> dirty` is settable by any writer; `dirty -> clean` only by
    /// the cache's write-back task
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    pub(crate) fn pins(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    // =========================================================================
    // Locking
    // =========================================================================

    pub(crate) fn read_pivots(&self) -> PivotsReadGuard {
        self.pivots.read_arc()
    }

    pub(crate) fn write_pivots(&self) -> PivotsWriteGuard {
        self.pivots.write_arc()
    }

    /// Write lock on leaves (they mutate pivot structure synchronously),
    /// read lock on internal nodes (their buffers are separately locked)
    pub(crate) fn optional_lock(&self) -> PivotGuard {
        if self.is_leaf() {
            PivotGuard::Write(self.write_pivots())
        } else {
            PivotGuard::Read(self.read_pivots())
        }
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Give a brand-new node its sentinel pivot (empty key, no child)
    pub(crate) fn create_first_pivot(&self) {
        let mut pivots = self.pivots.write();
        debug_assert!(pivots.is_empty(), "first pivot already exists");
        pivots.push(Pivot {
            child: None,
            buf: Arc::new(MsgBuf::new()),
            left_key: Bytes::new(),
        });
        self.set_dirty(true);
    }

    /// Bulk-install pivots on a node that has none yet (split siblings,
    /// fresh roots). The node must not be reachable from any parent yet.
    pub(crate) fn adopt_pivots(&self, new_pivots: Vec<Pivot>) {
        let mut pivots = self.pivots.write();
        debug_assert!(pivots.is_empty(), "adopting over existing pivots");
        *pivots = new_pivots;
        self.set_dirty(true);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Point lookup with hand-over-hand coupling: the caller's parent guard
    /// is dropped as soon as this node's read guard is held. The routed
    /// pivot's buffer answers first (a buffered Del hides anything deeper);
    /// otherwise the search descends into the child, pinned across the
    /// handoff.
    pub(crate) fn get(
        self: &Arc<Self>,
        tree: &BufferTree,
        key: &[u8],
        parent: Option<PivotsReadGuard>,
    ) -> Result<Option<Bytes>> {
        let guard = self.read_pivots();
        drop(parent);

        let idx = find_pivot(&guard, key);
        if let Some(msg) = guard[idx].buf.find(key) {
            return Ok(match msg {
                Msg::Put { value, .. } => Some(value),
                Msg::Del { .. } => None,
            });
        }

        let Some(child_nid) = guard[idx].child else {
            return Ok(None);
        };
        let (child, _pin) = tree.get_node(child_nid)?;
        child.get(tree, key, Some(guard))
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Insert a message into the routed pivot's buffer and cascade. Only
    /// reachable through the tree handle, which pins the current root and
    /// retries stale-root races before calling in.
    pub(crate) fn apply_write(
        self: &Arc<Self>,
        tree: &BufferTree,
        msg: Msg,
        guard: PivotGuard,
    ) -> Result<()> {
        debug_assert!(!guard.is_empty(), "node has no pivots");

        let idx = find_pivot(&guard, msg.key());
        guard[idx].buf.insert(msg);
        self.set_dirty(true);

        self.push_down_or_split(tree, guard)
    }

    /// Cascade until no pivot buffer exceeds the threshold: push an
    /// overflowing buffer into its child, or split it at a leaf. A single
    /// write may cross multiple thresholds before this returns.
    ///
    /// A one-entry buffer over the threshold is carried, not split — it
    /// cannot be halved, and at an internal node the ordinary push-down
    /// already applies.
    fn push_down_or_split(self: &Arc<Self>, tree: &BufferTree, mut guard: PivotGuard) -> Result<()> {
        loop {
            let threshold = tree.opts().max_pivot_msg_bytes;
            let overflow = guard.iter().position(|p| {
                p.buf.size() > threshold && (p.child.is_some() || p.buf.count() >= 2)
            });
            let Some(idx) = overflow else {
                return Ok(());
            };

            match guard[idx].child {
                Some(child_nid) => {
                    let (child, _pin) = tree.get_node(child_nid)?;
                    child.push_down(tree, self, guard, idx)?;
                }
                None => {
                    self.split_buf(tree, guard, idx)?;
                }
            }
            guard = self.optional_lock();
        }
    }

    /// Receive the contents of `parent`'s pivot buffer at `parent_idx`,
    /// releasing the parent's guard once this node is locked (coupled
    /// handoff), then continue the cascade here
    fn push_down(
        self: &Arc<Self>,
        tree: &BufferTree,
        parent: &Arc<Node>,
        parent_guard: PivotGuard,
        parent_idx: usize,
    ) -> Result<()> {
        let guard = self.optional_lock();
        self.push_down_locked(&guard, &parent_guard[parent_idx].buf, parent);
        drop(parent_guard);

        self.push_down_or_split(tree, guard)
    }

    /// Merge-partition `buf` into this node's pivot buffers. The source
    /// buffer's lock is held for the whole transfer, so a reader blocked on
    /// it either sees the entries in the parent or, after descending, in
    /// this node — never in neither. Entries move in ascending key order;
    /// last-write-wins per key is preserved because a buffer holds at most
    /// one entry per key.
    pub(crate) fn push_down_locked(&self, pivots: &[Pivot], buf: &MsgBuf, parent: &Node) {
        let mut moved = 0usize;
        buf.drain_with(|msg| {
            let idx = find_pivot(pivots, msg.key());
            pivots[idx].buf.insert(msg);
            moved += 1;
        });
        if moved == 0 {
            return;
        }

        trace!(
            from = parent.nid(),
            to = self.nid(),
            moved,
            "pushed buffer down"
        );
        self.set_dirty(true);
        parent.set_dirty(true);
    }

    /// Split an overflowing leaf buffer at its ordinal middle and insert the
    /// upper half as a new pivot. Afterwards, outside this node's lock,
    /// re-lock the whole root-to-leaf path for the buffer's original first
    /// key (the structure may have moved) and let the tree check whether the
    /// extra pivot overflowed the fan-out limit.
    fn split_buf(self: &Arc<Self>, tree: &BufferTree, guard: PivotGuard, idx: usize) -> Result<()> {
        let mut pivots = match guard {
            PivotGuard::Write(g) => g,
            // Only leaves split buffers, and leaves are always write-locked
            PivotGuard::Read(_) => unreachable!("buffer split without a write lock"),
        };
        debug_assert!(self.is_leaf());

        let buf = pivots[idx].buf.clone();
        // May have been resolved by a concurrent cascade
        if buf.size() <= tree.opts().max_pivot_msg_bytes {
            return Ok(());
        }
        let Some(split) = buf.split_upper_half() else {
            return Ok(());
        };

        debug!(
            nid = self.nid(),
            middle = ?split.middle_key,
            "splitting leaf pivot buffer"
        );

        let at = find_pivot(&pivots, &split.middle_key) + 1;
        pivots.insert(
            at,
            Pivot {
                child: None,
                buf: Arc::new(split.upper),
                left_key: split.middle_key,
            },
        );
        self.set_dirty(true);
        drop(pivots);

        let path = tree.lock_path(&split.first_key)?;
        if !path.is_empty() {
            tree.split_overflowing(path)?;
        }
        Ok(())
    }

    /// Root-to-leaf descent retaining every write lock, flushing the routed
    /// pivot's buffer into each child on the way down so split decisions at
    /// the leaf see up-to-date structure. The caller receives the path with
    /// all locks (and pins) still held.
    pub(crate) fn lock_path(
        self: Arc<Self>,
        tree: &BufferTree,
        key: &[u8],
        pin: PinGuard,
        guard: PivotsWriteGuard,
        path: &mut LockedPath,
    ) -> Result<()> {
        let mut node = self;
        let mut pin = pin;
        let mut guard = guard;

        loop {
            let idx = find_pivot(&guard, key);
            let child_nid = guard[idx].child;
            let buf = guard[idx].buf.clone();
            let parent = node.clone();
            path.push(node, pin, guard);

            let Some(child_nid) = child_nid else {
                return Ok(());
            };
            let (child, child_pin) = tree.get_node(child_nid)?;
            let child_guard = child.write_pivots();
            child.push_down_locked(&child_guard, &buf, &parent);

            node = child;
            pin = child_pin;
            guard = child_guard;
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Estimated serialized footprint; drives the cache's memory accounting.
    /// Takes the pivot read lock, so the cache only calls this outside its
    /// index lock. The result is also published through [`Node::size_estimate`].
    pub(crate) fn write_back_size(&self) -> usize {
        let pivots = self.pivots.read();
        let mut size = 1 + 4 + 4; // leaf flag, nid, pivot count
        for p in pivots.iter() {
            size += 4; // child nid
            size += 4 + p.left_key.len();
            size += p.buf.size();
        }
        let size = size + 4; // crc trailer
        self.size_estimate.store(size, Ordering::Release);
        size
    }

    /// Last computed footprint, lock-free. May lag the live structure until
    /// the next write-back cycle refreshes it.
    pub(crate) fn size_estimate(&self) -> usize {
        self.size_estimate.load(Ordering::Acquire)
    }

    /// Node image: `{leaf:1B, nid:4B, pivot count:4B, per pivot (child:4B,
    /// key len:4B, key bytes, serialized buffer)}`, crc32 trailer
    pub(crate) fn encode(&self) -> Bytes {
        let pivots = self.pivots.read();
        let mut body = BytesMut::new();
        body.put_u8(self.is_leaf() as u8);
        body.put_u32_le(self.nid);
        body.put_u32_le(pivots.len() as u32);
        for p in pivots.iter() {
            body.put_u32_le(p.child.unwrap_or(NID_NIL));
            body.put_u32_le(p.left_key.len() as u32);
            body.put_slice(&p.left_key);
            p.buf.encode(&mut body);
        }
        let crc = crc32fast::hash(&body);
        body.put_u32_le(crc);
        body.freeze()
    }

    /// Rehydrate a node from its persisted image. The result is marked
    /// dirty on purpose: a loaded node re-enters the write-back set on the
    /// next cycle instead of being trusted as clean. This is a convention,
    /// not a correctness requirement.
    pub(crate) fn decode(image: &[u8]) -> Result<Node> {
        if image.len() < 4 {
            return Err(CascadeError::Corruption(
                "node image shorter than its checksum".to_string(),
            ));
        }
        let (body, trailer) = image.split_at(image.len() - 4);
        let expect = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if actual != expect {
            return Err(CascadeError::Corruption(format!(
                "node image checksum mismatch: expected {expect:#010x}, computed {actual:#010x}"
            )));
        }

        let mut src = body;
        let leaf = codec::get_u8(&mut src)? != 0;
        let nid = codec::get_u32(&mut src)?;
        if nid == NID_NIL {
            return Err(CascadeError::Corruption(
                "node image with nil id".to_string(),
            ));
        }
        let count = codec::get_u32(&mut src)?;
        if count == 0 {
            return Err(CascadeError::Corruption(
                "node image with zero pivots".to_string(),
            ));
        }

        let mut pivots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let child = codec::get_u32(&mut src)?;
            // Internal pivots always route somewhere; a nil child here is a
            // forged or mangled image, not a childless leaf pivot
            if !leaf && child == NID_NIL {
                return Err(CascadeError::Corruption(
                    "internal node pivot without a child".to_string(),
                ));
            }
            let left_key = codec::get_len_prefixed(&mut src)?;
            let buf = MsgBuf::decode(&mut src)?;
            pivots.push(Pivot {
                child: (child != NID_NIL).then_some(child),
                buf: Arc::new(buf),
                left_key,
            });
        }
        if !src.is_empty() {
            return Err(CascadeError::Corruption(format!(
                "{} trailing bytes after node image",
                src.len()
            )));
        }

        let node = Node::new(nid, leaf);
        *node.pivots.write() = pivots;
        node.set_dirty(true);
        Ok(node)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("nid", &self.nid)
            .field("leaf", &self.is_leaf())
            .field("dirty", &self.dirty())
            .field("pins", &self.pins())
            .finish()
    }
}
