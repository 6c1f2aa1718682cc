//! Locked root-to-leaf path
//!
//! Split propagation needs a consistent snapshot from the affected leaf all
//! the way up to the root, so `lock_path` retains every write lock on the
//! descent instead of coupling. `LockedPath` is the explicit value type for
//! that lock set: entries keep the node pinned and write-locked, and
//! dropping the path releases everything in leaf-to-root order.

use std::sync::Arc;

use crate::tree::node::{Node, PinGuard, PivotsWriteGuard};

pub(crate) struct PathEntry {
    pub(crate) node: Arc<Node>,
    pub(crate) guard: PivotsWriteGuard,
    _pin: PinGuard,
}

/// Write-locked, pinned nodes from the root down to some node
#[derive(Default)]
pub(crate) struct LockedPath {
    entries: Vec<PathEntry>,
}

impl LockedPath {
    pub(crate) fn push(&mut self, node: Arc<Node>, pin: PinGuard, guard: PivotsWriteGuard) {
        self.entries.push(PathEntry {
            node,
            guard,
            _pin: pin,
        });
    }

    /// Deepest remaining entry, released to the caller
    pub(crate) fn pop(&mut self) -> Option<PathEntry> {
        self.entries.pop()
    }

    /// Deepest remaining entry, still held by the path
    pub(crate) fn last_mut(&mut self) -> Option<&mut PathEntry> {
        self.entries.last_mut()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for LockedPath {
    fn drop(&mut self) {
        // Unlock leaf-to-root
        while self.entries.pop().is_some() {}
    }
}
