//! Persistence collaborator
//!
//! The tree core never touches a disk format directly. Everything it needs
//! from durable storage is behind the [`NodeStore`] trait: locate a node
//! image by id, durably write a batch of dirty node images, and keep the
//! root-id / node-count bookkeeping. A file-backed layout plugs in here;
//! the bundled [`MemStore`] keeps everything in process memory, which is
//! enough for an embedded cache-resident workload and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;

/// Node identifier. `0` (`NID_NIL`) is reserved and never names a node.
pub type Nid = u32;

/// The reserved "no node" id
pub const NID_NIL: Nid = 0;

/// Contract the tree core requires from its persistence layer
pub trait NodeStore: Send + Sync + 'static {
    /// Locate the serialized image for `nid`, or `None` if the store has
    /// never seen that id
    fn find(&self, nid: Nid) -> Result<Option<Bytes>>;

    /// Durably persist a batch of node images. The batch is all-or-nothing
    /// from the cache's point of view: on error no node is marked clean.
    fn write_batch(&self, nodes: &[(Nid, Bytes)]) -> Result<()>;

    /// Current root id, or `NID_NIL` if the store is empty
    fn root_id(&self) -> Result<Nid>;

    fn set_root_id(&self, nid: Nid) -> Result<()>;

    /// Highest node id ever written; seeds the tree's id counter on open
    fn node_count(&self) -> Result<u32>;
}

/// In-memory `NodeStore` implementation
#[derive(Default)]
pub struct MemStore {
    nodes: RwLock<HashMap<Nid, Bytes>>,
    root: AtomicU32,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of node images currently held (test observability)
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Whether an image for `nid` is present (test observability)
    pub fn contains(&self, nid: Nid) -> bool {
        self.nodes.read().contains_key(&nid)
    }
}

impl NodeStore for MemStore {
    fn find(&self, nid: Nid) -> Result<Option<Bytes>> {
        Ok(self.nodes.read().get(&nid).cloned())
    }

    fn write_batch(&self, batch: &[(Nid, Bytes)]) -> Result<()> {
        let mut nodes = self.nodes.write();
        for (nid, image) in batch {
            nodes.insert(*nid, image.clone());
        }
        Ok(())
    }

    fn root_id(&self) -> Result<Nid> {
        Ok(self.root.load(Ordering::Acquire))
    }

    fn set_root_id(&self, nid: Nid) -> Result<()> {
        self.root.store(nid, Ordering::Release);
        Ok(())
    }

    fn node_count(&self) -> Result<u32> {
        Ok(self.nodes.read().keys().copied().max().unwrap_or(NID_NIL))
    }
}
