//! Storage module for persistent collaboration session records using Sled.
//!
//! Sessions are stored one record per node, serialized as JSON. Sled
//! gives per-key atomic upserts, which is all the session manager needs: it
//! serializes read-modify-write cycles per node itself.

mod sled_store;

pub use sled_store::{SessionStore, StorageError, StorageResult};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, millis: u64) -> Self {
        self.flush_interval_ms = millis;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.flush_interval_ms, 500);
    }

    #[test]
    fn test_storage_config_builder() {
        let config = StorageConfig::new("/tmp/test.sled")
            .with_cache_size(1024)
            .with_flush_interval(0);

        assert_eq!(config.path, "/tmp/test.sled");
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.flush_interval_ms, 0);
    }
}
