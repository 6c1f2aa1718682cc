//! Configuration for CascadeKV
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use crate::error::{CascadeError, Result};

/// Main configuration for a CascadeKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Tree Configuration
    // -------------------------------------------------------------------------
    /// Max number of pivots a node may hold before it splits
    pub max_node_children: usize,

    /// Byte-size threshold for a single pivot's message buffer; crossing it
    /// triggers a push-down (internal node) or buffer split (leaf). This is
    /// a sizing heuristic over encoded entry sizes, not an exact byte count.
    pub max_pivot_msg_bytes: usize,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Resident memory budget (estimated write-back footprint of cached
    /// nodes) before the cache starts evicting clean nodes
    pub cache_limit_bytes: usize,

    /// Poll interval of the background write-back thread
    pub writeback_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_node_children: 16,
            max_pivot_msg_bytes: 16 * 1024,
            cache_limit_bytes: 256 * 1024 * 1024, // 256 MB
            writeback_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the option values are internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.max_node_children < 2 {
            return Err(CascadeError::Config(
                "max_node_children must be at least 2".to_string(),
            ));
        }
        if self.max_pivot_msg_bytes == 0 {
            return Err(CascadeError::Config(
                "max_pivot_msg_bytes must be non-zero".to_string(),
            ));
        }
        if self.writeback_interval.is_zero() {
            return Err(CascadeError::Config(
                "writeback_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the pivot fan-out limit before a node splits
    pub fn max_node_children(mut self, count: usize) -> Self {
        self.config.max_node_children = count;
        self
    }

    /// Set the per-pivot buffer byte threshold before a cascade/split
    pub fn max_pivot_msg_bytes(mut self, bytes: usize) -> Self {
        self.config.max_pivot_msg_bytes = bytes;
        self
    }

    /// Set the cache memory budget (in bytes)
    pub fn cache_limit_bytes(mut self, bytes: usize) -> Self {
        self.config.cache_limit_bytes = bytes;
        self
    }

    /// Set the background write-back poll interval
    pub fn writeback_interval(mut self, interval: Duration) -> Self {
        self.config.writeback_interval = interval;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = Config::builder()
            .max_node_children(4)
            .max_pivot_msg_bytes(256)
            .cache_limit_bytes(1024 * 1024)
            .writeback_interval(Duration::from_millis(10))
            .build();

        assert_eq!(config.max_node_children, 4);
        assert_eq!(config.max_pivot_msg_bytes, 256);
        assert_eq!(config.cache_limit_bytes, 1024 * 1024);
        assert_eq!(config.writeback_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_degenerate_fanout_rejected() {
        let config = Config::builder().max_node_children(1).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = Config::builder().max_pivot_msg_bytes(0).build();
        assert!(config.validate().is_err());
    }
}
