//! Configuration for the sync tree.

use std::path::PathBuf;

use treesync_persistence::{CacheConfig, PersistenceConfig};

use crate::error::SyncResult;

/// Configuration used by [`SyncTree::open`](crate::SyncTree::open).
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Local cache settings.
    pub persistence: PersistenceConfig,
}

impl EngineConfig {
    /// Creates a configuration with the local cache disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the local cache settings.
    #[must_use]
    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Enables an on-disk cache in `dir` with default thresholds.
    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence = self.persistence.enabled(true).path(dir);
        self
    }

    /// Sets the cache eviction thresholds.
    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.persistence = self.persistence.cache(cache);
        self
    }

    /// Checks the configuration without opening anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache thresholds are out of range.
    pub fn validate(&self) -> SyncResult<()> {
        if self.persistence.enabled {
            self.persistence.cache.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert!(!config.persistence.enabled);
        assert!(config.persistence.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .cache_dir("/tmp/treesync")
            .cache(CacheConfig::new().max_size_bytes(2 * 1024 * 1024));
        assert!(config.persistence.enabled);
        assert_eq!(config.persistence.path, Some(PathBuf::from("/tmp/treesync")));
        assert_eq!(config.persistence.cache.max_size_bytes, 2 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_cache_is_rejected() {
        let config = EngineConfig::new()
            .persistence(PersistenceConfig::new().enabled(true))
            .cache(CacheConfig::new().max_size_bytes(10));
        assert!(config.validate().is_err());

        let disabled = EngineConfig::new().cache(CacheConfig::new().max_size_bytes(10));
        assert!(disabled.validate().is_ok());
    }
}
