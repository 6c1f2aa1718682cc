//! # CascadeKV
//!
//! An embedded, write-optimized key-value store built on a buffered
//! (cascading) search tree — a Bε-tree relative where every node amortizes
//! random writes by parking pending mutations in per-pivot in-memory
//! buffers and flushing them lazily toward the leaves.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Db                                  │
//! │                 (put / get / del / flush)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      BufferTree                              │
//! │        (root ownership, grow-up, stale-root retry)           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │    Node     │◄────────►│    Cache    │
//!   │ (pivots +   │  nid →   │ (LRU, pins, │
//!   │  MsgBufs)   │  Node    │ write-back) │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                                   ▼
//!                           ┌─────────────┐
//!                           │  NodeStore  │
//!                           │ (collabora- │
//!                           │ tor trait)  │
//!                           └─────────────┘
//! ```
//!
//! Writes land in the root's routed pivot buffer; once a buffer crosses
//! the configured byte threshold it is pushed down into the child (or, at
//! a leaf, split). Buffer splits can overflow a node's pivot fan-out and
//! escalate into node splits, which can grow a brand-new root. Lookups
//! descend with hand-over-hand lock coupling, consulting each level's
//! buffer before the child. A background thread write-backs dirty nodes
//! to the persistence collaborator; eviction only ever drops clean ones.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

mod codec;

pub mod msg;
pub mod store;
pub mod tree;
pub mod cache;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::Cache;
pub use config::Config;
pub use db::Db;
pub use error::{CascadeError, Result};
pub use store::{MemStore, Nid, NodeStore, NID_NIL};
pub use tree::BufferTree;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CascadeKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
