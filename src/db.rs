//! Database handle
//!
//! The caller-facing surface: wires store → cache → tree, starts the
//! write-back thread, and shuts everything down (with a final flush) on
//! drop, so a reopened store sees every write.

use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::store::{MemStore, Nid, NodeStore};
use crate::tree::BufferTree;

/// An open CascadeKV database
pub struct Db {
    name: String,
    tree: BufferTree,
    cache: Arc<Cache>,
    store: Arc<dyn NodeStore>,
}

impl Db {
    /// Open a database backed by a fresh in-memory store
    pub fn open(name: impl Into<String>, config: Config) -> Result<Self> {
        Self::open_with_store(name, config, Arc::new(MemStore::new()))
    }

    /// Open against a caller-supplied persistence collaborator. Fails if
    /// the configuration is invalid or any subsystem fails to initialize.
    pub fn open_with_store(
        name: impl Into<String>,
        config: Config,
        store: Arc<dyn NodeStore>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let cache = Arc::new(Cache::new(&config));
        // The tree ties the cache to the store; only then is the
        // write-back thread allowed to run
        let tree = BufferTree::open(&name, config, Arc::clone(&cache), Arc::clone(&store))?;
        cache.start()?;

        info!(name = %name, root = tree.root_nid(), "opened database");
        Ok(Self {
            name,
            tree,
            cache,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current root node id
    pub fn root_id(&self) -> Nid {
        self.tree.root_nid()
    }

    /// The persistence collaborator this database writes back to
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    // =========================================================================
    // Key-value API
    // =========================================================================

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.put(key, value)
    }

    /// `Ok(None)` means not found or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.tree.get(key)
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.tree.del(key)
    }

    /// Run one synchronous write-back cycle
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.cache.shutdown();
        info!(name = %self.name, "closed database");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_put_get() {
        let db = Db::open("t", Config::default()).unwrap();
        db.put(b"hello", b"world").unwrap();
        assert_eq!(db.get(b"hello").unwrap(), Some(Bytes::from_static(b"world")));
        assert_eq!(db.get(b"absent").unwrap(), None);
    }

    #[test]
    fn test_invalid_config_refuses_to_open() {
        let config = Config::builder().max_node_children(1).build();
        assert!(Db::open("t", config).is_err());
    }

    #[test]
    fn test_flush_persists_to_store() {
        let store = Arc::new(MemStore::new());
        let db = Db::open_with_store("t", Config::default(), store.clone()).unwrap();
        db.put(b"k", b"v").unwrap();
        assert!(store.is_empty());

        db.flush().unwrap();
        assert!(!store.is_empty());
        assert_eq!(store.root_id().unwrap(), db.root_id());
    }

    #[test]
    fn test_reopen_sees_flushed_data() {
        let store = Arc::new(MemStore::new());
        {
            let db = Db::open_with_store("t", Config::default(), store.clone()).unwrap();
            for i in 0..100 {
                db.put(format!("k{i:03}").as_bytes(), format!("v{i:03}").as_bytes())
                    .unwrap();
            }
            db.del(b"k050").unwrap();
            // Drop runs the final flush
        }

        let db = Db::open_with_store("t", Config::default(), store).unwrap();
        for i in 0..100 {
            let got = db.get(format!("k{i:03}").as_bytes()).unwrap();
            if i == 50 {
                assert_eq!(got, None);
            } else {
                assert_eq!(got.as_deref(), Some(format!("v{i:03}").as_bytes()));
            }
        }
    }
}
