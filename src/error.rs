//! Error types for CascadeKV
//!
//! Provides a unified error type for all operations.
//!
//! A missing key is never an error: lookups report it as `Ok(None)`. The
//! variants here cover the failures that *are* propagated to callers —
//! I/O, persistence faults, corrupted node images, and bad configuration.

use thiserror::Error;

/// Result type alias using CascadeError
pub type Result<T> = std::result::Result<T, CascadeError>;

/// Unified error type for CascadeKV operations
#[derive(Debug, Error)]
pub enum CascadeError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    #[error("Store error: {0}")]
    Store(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
