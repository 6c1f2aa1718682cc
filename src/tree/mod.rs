//! Buffer Tree Module
//!
//! The tree handle: owns the current root, allocates node ids, exposes
//! `put`/`get`/`del`, swaps the root on a grow-up and provides the
//! whole-path locking used by split propagation.
//!
//! ## Responsibilities
//! - Bind the cache to the persistence layer and load or create the root
//! - Pin the root across every operation so a concurrent grow-up cannot
//!   retire it mid-call
//! - Retry writes that raced a root replacement (the one built-in retry:
//!   writes must always enter through the current root)
//! - Allocate node ids and replace the root under one structural lock, so
//!   id allocation and root swaps cannot interleave badly

pub(crate) mod node;
pub(crate) mod path;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::msg::Msg;
use crate::store::{Nid, NodeStore, NID_NIL};
use crate::tree::node::{find_pivot, Node, PinGuard, Pivot};
use crate::tree::path::LockedPath;

/// Root pointer and id counter, guarded together: node creation and root
/// replacement under separate locks would allow root-swap/new-node races
struct TreeState {
    root: Arc<Node>,
    /// Standing pin: the current root can never be evicted out from under
    /// the write-back set. Transferred on grow-up.
    root_pin: PinGuard,
    node_count: u32,
}

/// The buffered search tree
pub struct BufferTree {
    name: String,
    opts: Config,
    cache: Arc<Cache>,
    store: Arc<dyn NodeStore>,
    state: Mutex<TreeState>,
    /// Serializes whole-path lockers; splits are rare enough that one at a
    /// time is fine and it keeps their root handshakes simple
    path_lock: Mutex<()>,
}

impl BufferTree {
    /// Bind the cache to the store and load or create the root
    pub(crate) fn open(
        name: &str,
        opts: Config,
        cache: Arc<Cache>,
        store: Arc<dyn NodeStore>,
    ) -> Result<Self> {
        cache.tie(Arc::clone(&store));

        let root_nid = store.root_id()?;
        let (root, root_pin, node_count) = if root_nid == NID_NIL {
            let nid = 1;
            let (root, pin) = cache.new_node(nid, true);
            root.create_first_pivot();
            store.set_root_id(nid)?;
            info!(name, nid, "created fresh root leaf");
            (root, pin, nid)
        } else {
            let (root, pin) = cache.get_node(root_nid)?;
            let node_count = store.node_count()?.max(root_nid);
            info!(name, root_nid, node_count, "loaded existing root");
            (root, pin, node_count)
        };

        Ok(Self {
            name: name.to_string(),
            opts,
            cache,
            store,
            state: Mutex::new(TreeState {
                root,
                root_pin,
                node_count,
            }),
            path_lock: Mutex::new(()),
        })
    }

    pub(crate) fn opts(&self) -> &Config {
        &self.opts
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current root id
    pub fn root_nid(&self) -> Nid {
        self.state.lock().root.nid()
    }

    fn current_root(&self) -> Arc<Node> {
        Arc::clone(&self.state.lock().root)
    }

    // =========================================================================
    // Key-value operations
    // =========================================================================

    /// Caller slices are deep-copied here, at the boundary: the tree never
    /// aliases caller-owned memory
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Msg::Put {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        })
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.write(Msg::Del {
            key: Bytes::copy_from_slice(key),
        })
    }

    /// `Ok(None)` covers both an absent key and a buffered delete
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let root = self.current_root();
        let _pin = PinGuard::new(Arc::clone(&root));
        root.get(self, key, None)
    }

    /// Writes must enter through the current root: pivot routing and root
    /// identity can change between reading `root` and locking it, so a
    /// stale root is released and the write transparently retried
    fn write(&self, msg: Msg) -> Result<()> {
        loop {
            let root = self.current_root();
            let _pin = PinGuard::new(Arc::clone(&root));
            let guard = root.optional_lock();
            if !Arc::ptr_eq(&root, &self.current_root()) {
                continue;
            }
            return root.apply_write(self, msg, guard);
        }
    }

    // =========================================================================
    // Node management
    // =========================================================================

    /// Resident node for `nid`, pinned from the moment the cache hands it
    /// out — there is no window for the evictor to race the pin
    pub(crate) fn get_node(&self, nid: Nid) -> Result<(Arc<Node>, PinGuard)> {
        self.cache.get_node(nid)
    }

    /// Allocate the next id and register a brand-new node with the cache.
    /// The returned pin keeps the node resident until the caller links it
    /// into the structure.
    pub(crate) fn create_node(&self, leaf: bool) -> (Arc<Node>, PinGuard) {
        let mut state = self.state.lock();
        let nid = state.node_count + 1;
        state.node_count = nid;
        self.cache.new_node(nid, leaf)
    }

    /// Install a new root: atomic from callers' point of view. The old
    /// root's standing pin transfers to the new root, and the new root id
    /// is persisted immediately.
    pub(crate) fn grow_up(&self, new_root: Arc<Node>) -> Result<()> {
        let pin = PinGuard::new(Arc::clone(&new_root));
        let mut state = self.state.lock();
        debug!(
            old = state.root.nid(),
            new = new_root.nid(),
            "growing a new root"
        );
        state.root = new_root;
        state.root_pin = pin;
        self.store.set_root_id(state.root.nid())
    }

    // =========================================================================
    // Split propagation
    // =========================================================================

    /// Write-lock the whole root-to-leaf path for `key`, pushing buffers
    /// down along the way. An empty path means the root moved between the
    /// caller reading it and locking it — a benign no-op, the caller's
    /// split check will happen on some other path's watch.
    pub(crate) fn lock_path(&self, key: &[u8]) -> Result<LockedPath> {
        let _serial = self.path_lock.lock();

        let root = self.current_root();
        let pin = PinGuard::new(Arc::clone(&root));
        let guard = root.write_pivots();
        if !Arc::ptr_eq(&root, &self.current_root()) {
            return Ok(LockedPath::default());
        }

        let mut path = LockedPath::default();
        Arc::clone(&root).lock_path(self, key, pin, guard, &mut path)?;
        Ok(path)
    }

    /// Walk the held path from its deepest node upward, splitting every
    /// node over the fan-out limit. Splitting the root creates a brand-new
    /// internal root with two pivots and installs it via [`grow_up`].
    ///
    /// [`grow_up`]: BufferTree::grow_up
    pub(crate) fn split_overflowing(&self, mut path: LockedPath) -> Result<()> {
        loop {
            let Some(mut entry) = path.pop() else {
                return Ok(());
            };
            if entry.guard.len() <= self.opts.max_node_children {
                // Within limits; dropping the path unlocks leaf-to-root
                return Ok(());
            }

            let mid = entry.guard.len() / 2;
            let middle_key = entry.guard[mid].left_key.clone();
            let (sibling, _sibling_pin) = self.create_node(entry.node.is_leaf());
            let upper = entry.guard.split_off(mid);
            sibling.adopt_pivots(upper);
            entry.node.set_dirty(true);

            debug!(
                nid = entry.node.nid(),
                sibling = sibling.nid(),
                depth = path.len(),
                "splitting node"
            );

            match path.last_mut() {
                Some(parent) => {
                    // The parent may itself have just overflowed; loop up
                    let at = find_pivot(&parent.guard, &middle_key) + 1;
                    parent
                        .guard
                        .insert(at, Pivot::route(sibling.nid(), middle_key));
                    parent.node.set_dirty(true);
                }
                None => {
                    let (new_root, _root_pin) = self.create_node(false);
                    new_root.adopt_pivots(vec![
                        Pivot::route(entry.node.nid(), Bytes::new()),
                        Pivot::route(sibling.nid(), middle_key),
                    ]);
                    self.grow_up(new_root)?;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::time::Duration;

    fn small_config() -> Config {
        Config::builder()
            .max_node_children(4)
            .max_pivot_msg_bytes(256)
            .cache_limit_bytes(64 * 1024 * 1024)
            .writeback_interval(Duration::from_millis(50))
            .build()
    }

    fn open_tree(config: Config) -> BufferTree {
        let store: Arc<dyn NodeStore> = Arc::new(MemStore::new());
        let cache = Arc::new(Cache::new(&config));
        BufferTree::open("test", config, cache, store).unwrap()
    }

    #[test]
    fn test_fresh_tree_has_leaf_root() {
        let tree = open_tree(small_config());
        assert_eq!(tree.root_nid(), 1);
        assert_eq!(tree.get(b"anything").unwrap(), None);
    }

    #[test]
    fn test_put_get_del() {
        let tree = open_tree(small_config());

        tree.put(b"k1", b"v1").unwrap();
        tree.put(b"k2", b"v2").unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(Bytes::from_static(b"v1")));
        assert_eq!(tree.get(b"k2").unwrap(), Some(Bytes::from_static(b"v2")));

        tree.del(b"k1").unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), None);
        assert_eq!(tree.get(b"k2").unwrap(), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn test_overwrite_takes_latest_value() {
        let tree = open_tree(small_config());

        tree.put(b"k", b"old").unwrap();
        tree.put(b"k", b"new").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn test_del_then_put_resurrects_key() {
        let tree = open_tree(small_config());

        tree.put(b"k", b"v1").unwrap();
        tree.del(b"k").unwrap();
        tree.put(b"k", b"v2").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn test_del_of_absent_key_is_silent() {
        let tree = open_tree(small_config());
        tree.del(b"never-written").unwrap();
        assert_eq!(tree.get(b"never-written").unwrap(), None);
    }

    #[test]
    fn test_cascade_grows_tree_and_preserves_keys() {
        let tree = open_tree(small_config());

        for i in 0..512 {
            let key = format!("key{i:04}");
            let value = format!("value{i:04}");
            tree.put(key.as_bytes(), value.as_bytes()).unwrap();
        }

        // Tight thresholds force buffer splits, node splits and a grow-up
        assert_ne!(tree.root_nid(), 1);

        for i in 0..512 {
            let key = format!("key{i:04}");
            let expect = format!("value{i:04}");
            assert_eq!(
                tree.get(key.as_bytes()).unwrap().as_deref(),
                Some(expect.as_bytes()),
                "lost key {key}"
            );
        }
    }

    #[test]
    fn test_splits_keep_deletes_visible() {
        let tree = open_tree(small_config());

        for i in 0..256 {
            tree.put(format!("k{i:04}").as_bytes(), b"v").unwrap();
        }
        for i in (0..256).step_by(2) {
            tree.del(format!("k{i:04}").as_bytes()).unwrap();
        }
        // Keep cascading after the deletes
        for i in 256..384 {
            tree.put(format!("k{i:04}").as_bytes(), b"v").unwrap();
        }

        for i in 0..256 {
            let key = format!("k{i:04}");
            let got = tree.get(key.as_bytes()).unwrap();
            if i % 2 == 0 {
                assert_eq!(got, None, "deleted key {key} came back");
            } else {
                assert_eq!(got.as_deref(), Some(&b"v"[..]), "lost key {key}");
            }
        }
    }

    #[test]
    fn test_oversized_single_value_is_carried() {
        let tree = open_tree(small_config());

        // One entry far beyond max_pivot_msg_bytes: unsplittable, must
        // still be stored and served
        let big = vec![0xabu8; 4 * 1024];
        tree.put(b"big", &big).unwrap();
        assert_eq!(tree.get(b"big").unwrap().as_deref(), Some(&big[..]));

        // And it must not wedge later traffic
        for i in 0..64 {
            tree.put(format!("k{i:04}").as_bytes(), b"v").unwrap();
        }
        assert_eq!(tree.get(b"big").unwrap().as_deref(), Some(&big[..]));
    }

    #[test]
    fn test_empty_key_is_a_valid_key() {
        let tree = open_tree(small_config());

        tree.put(b"", b"sentinel-adjacent").unwrap();
        assert_eq!(
            tree.get(b"").unwrap(),
            Some(Bytes::from_static(b"sentinel-adjacent"))
        );
        tree.del(b"").unwrap();
        assert_eq!(tree.get(b"").unwrap(), None);
    }
}
