//! Node Cache Module
//!
//! Maps node ids to resident in-memory nodes.
//!
//! ## Responsibilities
//! - Serve node lookups, rehydrating from the persistence layer on a miss
//! - Track recency (LRU) and an estimated memory footprint
//! - Run the background write-back thread: snapshot dirty nodes, persist
//!   them as a batch, clear their flags
//! - Evict down to the memory budget — clean, unpinned, non-flushing nodes
//!   only; a dirty node is never dropped before it has been written back
//!
//! ## Flag protocol
//! `clean -> dirty` is settable by any writer. `dirty -> clean` happens
//! only here, and `flushing` is raised first: writers that land during the
//! encode simply re-mark the node dirty for the next cycle, while the
//! raised `flushing` flag keeps the evictor away until the batch is
//! durable.
//!
//! The index lock is held only for map/LRU mutation — never across a store
//! read, a store write, or any node lock. Footprints are computed (under
//! the node's own lock) before the index lock is taken, and eviction reads
//! each node's published size estimate instead of re-measuring.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::error::{CascadeError, Result};
use crate::store::{Nid, NodeStore};
use crate::tree::node::{Node, PinGuard};

struct CacheInner {
    nodes: HashMap<Nid, Arc<Node>>,
    /// Front = most recently used
    lru: VecDeque<Nid>,
    /// Sum of estimated write-back footprints of resident nodes
    mem_usage: usize,
}

impl CacheInner {
    /// Look up and bump recency
    fn touch(&mut self, nid: Nid) -> Option<Arc<Node>> {
        let node = Arc::clone(self.nodes.get(&nid)?);
        if let Some(pos) = self.lru.iter().position(|n| *n == nid) {
            self.lru.remove(pos);
        }
        self.lru.push_front(nid);
        Some(node)
    }

    fn insert_front(&mut self, nid: Nid, node: Arc<Node>) {
        debug_assert!(!self.nodes.contains_key(&nid), "duplicate node id {nid}");
        self.nodes.insert(nid, node);
        self.lru.push_front(nid);
    }

    fn remove(&mut self, nid: Nid) -> Option<Arc<Node>> {
        let node = self.nodes.remove(&nid)?;
        if let Some(pos) = self.lru.iter().position(|n| *n == nid) {
            self.lru.remove(pos);
        }
        Some(node)
    }
}

/// Working set of in-memory nodes with write-back and eviction
pub struct Cache {
    limit_bytes: usize,
    interval: Duration,
    inner: Mutex<CacheInner>,
    /// Bound once at tree initialization; the first binding wins
    store: OnceLock<Arc<dyn NodeStore>>,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Write-back cycles completed (observability)
    cycles: AtomicUsize,
}

impl Cache {
    pub fn new(config: &Config) -> Self {
        Self {
            limit_bytes: config.cache_limit_bytes,
            interval: config.writeback_interval,
            inner: Mutex::new(CacheInner {
                nodes: HashMap::new(),
                lru: VecDeque::new(),
                mem_usage: 0,
            }),
            store: OnceLock::new(),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
            cycles: AtomicUsize::new(0),
        }
    }

    /// Bind the cache to its persistence collaborator; not reconfigurable
    pub(crate) fn tie(&self, store: Arc<dyn NodeStore>) {
        let _ = self.store.set(store);
    }

    fn store(&self) -> Result<&Arc<dyn NodeStore>> {
        self.store
            .get()
            .ok_or_else(|| CascadeError::Store("cache is not tied to a node store".to_string()))
    }

    // =========================================================================
    // Node lookup
    // =========================================================================

    /// Register a brand-new node (tree init, splits). The returned pin
    /// keeps the empty node from being evicted before the caller links it.
    pub(crate) fn new_node(&self, nid: Nid, leaf: bool) -> (Arc<Node>, PinGuard) {
        let node = Arc::new(Node::new(nid, leaf));
        let pin = PinGuard::new(Arc::clone(&node));
        // Sized before the index lock; node locks are never taken under it
        let size = node.write_back_size();

        let mut inner = self.inner.lock();
        inner.insert_front(nid, Arc::clone(&node));
        inner.mem_usage += size;
        self.evict_locked(&mut inner);

        (node, pin)
    }

    /// Resident node for `nid`, loading and deserializing from the store
    /// on a miss. The store read happens outside the index lock. The node
    /// comes back pinned — the pin is taken while the index lock is still
    /// held, so eviction can never race the handoff and orphan a write.
    pub(crate) fn get_node(&self, nid: Nid) -> Result<(Arc<Node>, PinGuard)> {
        {
            let mut inner = self.inner.lock();
            if let Some(node) = inner.touch(nid) {
                let pin = PinGuard::new(Arc::clone(&node));
                return Ok((node, pin));
            }
        }

        trace!(nid, "cache miss, loading from store");
        let image = self.store()?.find(nid)?.ok_or_else(|| {
            CascadeError::Store(format!("node {nid} not found in store"))
        })?;
        let node = Arc::new(Node::decode(&image)?);
        if node.nid() != nid {
            return Err(CascadeError::Corruption(format!(
                "node image id mismatch: asked for {nid}, image says {}",
                node.nid()
            )));
        }
        let size = node.write_back_size();

        let mut inner = self.inner.lock();
        // Another thread may have loaded it while we read the store
        if let Some(existing) = inner.touch(nid) {
            let pin = PinGuard::new(Arc::clone(&existing));
            return Ok((existing, pin));
        }
        let pin = PinGuard::new(Arc::clone(&node));
        inner.mem_usage += size;
        inner.insert_front(nid, Arc::clone(&node));
        self.evict_locked(&mut inner);
        Ok((node, pin))
    }

    // =========================================================================
    // Write-back
    // =========================================================================

    /// Spawn the background write-back thread
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = bounded::<()>(0);
        *self.shutdown.lock() = Some(tx);

        let cache = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cascadekv-writeback".to_string())
            .spawn(move || cache.write_back(rx))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn write_back(&self, rx: Receiver<()>) {
        debug!("write-back thread started");
        loop {
            match rx.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.flush() {
                        error!(error = %e, "write-back cycle failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if let Err(e) = self.flush() {
                        error!(error = %e, "final write-back cycle failed");
                    }
                    break;
                }
            }
        }
        debug!("write-back thread stopped");
    }

    /// One synchronous write-back cycle: persist every dirty node as a
    /// batch, clear their flags, refresh the memory estimate and evict
    /// down to budget. This is the only path that clears `dirty`.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<Arc<Node>> = {
            let inner = self.inner.lock();
            inner
                .nodes
                .values()
                .filter(|n| n.dirty())
                .map(Arc::clone)
                .collect()
        };

        if !dirty.is_empty() {
            for node in &dirty {
                node.set_flushing(true);
                node.set_dirty(false);
            }
            let batch: Vec<(Nid, Bytes)> =
                dirty.iter().map(|n| (n.nid(), n.encode())).collect();

            if let Err(e) = self.store()?.write_batch(&batch) {
                // Batch failed as a whole: everything stays dirty
                for node in &dirty {
                    node.set_dirty(true);
                    node.set_flushing(false);
                }
                return Err(e);
            }
            for node in &dirty {
                node.set_flushing(false);
            }
            debug!(count = batch.len(), "wrote back dirty nodes");
        }

        // Refresh the estimate outside the index lock: sizing takes each
        // node's pivot lock. Nodes added or removed between the snapshot
        // and the store only skew the estimate until the next cycle.
        let resident: Vec<Arc<Node>> = {
            let inner = self.inner.lock();
            inner.nodes.values().map(Arc::clone).collect()
        };
        let total: usize = resident.iter().map(|n| n.write_back_size()).sum();

        let mut inner = self.inner.lock();
        inner.mem_usage = total;
        self.evict_locked(&mut inner);
        drop(inner);

        self.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Signal the write-back thread, wait for its final flush and join it
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            drop(tx);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Walk the LRU tail and drop nodes until under budget. Only clean,
    /// unpinned, non-flushing nodes are evictable: a dirty node dropped
    /// before write-back would silently lose committed updates.
    fn evict_locked(&self, inner: &mut CacheInner) {
        while inner.mem_usage >= self.limit_bytes {
            let victim = inner
                .lru
                .iter()
                .rev()
                .find(|nid| {
                    inner
                        .nodes
                        .get(*nid)
                        .map(|n| !n.dirty() && !n.flushing() && n.pins() == 0)
                        .unwrap_or(false)
                })
                .copied();
            let Some(nid) = victim else {
                // Everything at the tail is dirty, mid-flush or pinned;
                // stay over budget until the next write-back cycle
                break;
            };
            if let Some(node) = inner.remove(nid) {
                inner.mem_usage = inner.mem_usage.saturating_sub(node.size_estimate());
                trace!(nid, "evicted clean node");
            }
        }
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn resident_nodes(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn mem_usage(&self) -> usize {
        self.inner.lock().mem_usage
    }

    pub fn contains(&self, nid: Nid) -> bool {
        self.inner.lock().nodes.contains_key(&nid)
    }

    pub fn writeback_cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn test_config(limit: usize) -> Config {
        Config::builder()
            .cache_limit_bytes(limit)
            .writeback_interval(Duration::from_millis(10))
            .build()
    }

    fn tied_cache(limit: usize) -> (Arc<Cache>, Arc<MemStore>) {
        let cache = Arc::new(Cache::new(&test_config(limit)));
        let store = Arc::new(MemStore::new());
        cache.tie(store.clone());
        (cache, store)
    }

    /// A populated node so images survive decode
    fn seeded_node(cache: &Cache, nid: Nid) -> Arc<Node> {
        let (node, pin) = cache.new_node(nid, true);
        node.create_first_pivot();
        drop(pin);
        node
    }

    #[test]
    fn test_hit_returns_same_instance() {
        let (cache, _store) = tied_cache(usize::MAX);
        let node = seeded_node(&cache, 1);
        let (again, _pin) = cache.get_node(1).unwrap();
        assert!(Arc::ptr_eq(&node, &again));
        assert_eq!(cache.resident_nodes(), 1);
    }

    #[test]
    fn test_miss_loads_from_store() {
        let (cache, store) = tied_cache(usize::MAX);
        let node = seeded_node(&cache, 1);
        store.write_batch(&[(1, node.encode())]).unwrap();

        // Evict it by hand, then reload
        node.set_dirty(false);
        drop(node);
        {
            let mut inner = cache.inner.lock();
            inner.remove(1);
            inner.mem_usage = 0;
        }
        assert!(!cache.contains(1));

        let (reloaded, _pin) = cache.get_node(1).unwrap();
        assert_eq!(reloaded.nid(), 1);
        // Loaded-from-store nodes re-enter the write-back set
        assert!(reloaded.dirty());
        assert!(cache.contains(1));
    }

    #[test]
    fn test_missing_node_is_store_error() {
        let (cache, _store) = tied_cache(usize::MAX);
        assert!(matches!(
            cache.get_node(42),
            Err(CascadeError::Store(_))
        ));
    }

    #[test]
    fn test_flush_clears_dirty_and_persists() {
        let (cache, store) = tied_cache(usize::MAX);
        let node = seeded_node(&cache, 1);
        assert!(node.dirty());
        assert!(!store.contains(1));

        cache.flush().unwrap();

        assert!(!node.dirty());
        assert!(!node.flushing());
        assert!(store.contains(1));
        assert_eq!(cache.writeback_cycles(), 1);
    }

    #[test]
    fn test_eviction_spares_dirty_nodes() {
        // Budget of zero: everything evictable must go
        let (cache, _store) = tied_cache(1);
        let dirty = seeded_node(&cache, 1);
        let clean = seeded_node(&cache, 2);
        clean.set_dirty(false);

        // Any insert triggers eviction
        let extra = seeded_node(&cache, 3);
        extra.set_dirty(false);
        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }

        assert!(cache.contains(1), "dirty node was evicted before flush");
        assert!(!cache.contains(2));
        assert!(!cache.contains(3));
        assert!(dirty.dirty());
    }

    #[test]
    fn test_eviction_spares_mid_flush_nodes() {
        let (cache, store) = tied_cache(1);
        let node = seeded_node(&cache, 1);
        store.write_batch(&[(1, node.encode())]).unwrap();
        node.set_dirty(false);
        node.set_flushing(true);

        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(cache.contains(1), "mid-flush node was evicted");

        node.set_flushing(false);
        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_fetched_node_stays_resident_until_released() {
        let (cache, store) = tied_cache(1);
        let node = seeded_node(&cache, 1);
        store.write_batch(&[(1, node.encode())]).unwrap();
        node.set_dirty(false);
        drop(node);

        // The handle arrives pinned; pressure cannot push it out from
        // under a caller about to write through it
        let (node, pin) = cache.get_node(1).unwrap();
        node.set_dirty(false);
        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(cache.contains(1), "fetched node evicted under a live pin");

        // A write through the held handle reaches the next cycle
        node.set_dirty(true);
        cache.flush().unwrap();
        assert!(!node.dirty());
        assert!(cache.contains(1));

        node.set_dirty(false);
        drop(pin);
        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_flush_completes_while_a_node_lock_is_held() {
        let (cache, _store) = tied_cache(usize::MAX);
        let a = seeded_node(&cache, 1);
        let b = seeded_node(&cache, 2);
        a.set_dirty(false);
        b.set_dirty(false);

        // Hold a node's write lock across a full flush cycle: the cycle
        // may wait on the node, but never while holding the index lock
        let guard = a.write_pivots();
        let flusher = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.flush().unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));

        // The index must stay available to lock holders
        let (fetched, _pin) = cache.get_node(2).unwrap();
        assert_eq!(fetched.nid(), 2);

        drop(guard);
        flusher.join().unwrap();
    }

    #[test]
    fn test_eviction_spares_pinned_nodes() {
        let (cache, store) = tied_cache(1);
        let (node, pin) = cache.new_node(1, true);
        node.create_first_pivot();
        store.write_batch(&[(1, node.encode())]).unwrap();
        node.set_dirty(false);

        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(cache.contains(1), "pinned node was evicted");

        drop(pin);
        {
            let mut inner = cache.inner.lock();
            cache.evict_locked(&mut inner);
        }
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_flush_then_eviction_under_pressure() {
        let (cache, store) = tied_cache(1);
        let node = seeded_node(&cache, 1);
        assert!(cache.contains(1));

        // Flush writes it back and the post-flush eviction may now drop it
        cache.flush().unwrap();
        assert!(store.contains(1));
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_background_thread_flushes_and_stops() {
        let (cache, store) = tied_cache(usize::MAX);
        let node = seeded_node(&cache, 1);

        cache.start().unwrap();
        // A couple of poll intervals is plenty
        std::thread::sleep(Duration::from_millis(100));
        assert!(store.contains(1));
        assert!(!node.dirty());

        cache.shutdown();
        let cycles = cache.writeback_cycles();
        std::thread::sleep(Duration::from_millis(50));
        // No cycles after shutdown
        assert_eq!(cache.writeback_cycles(), cycles);
    }
}
