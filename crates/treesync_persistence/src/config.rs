//! Persistence configuration.

use std::path::PathBuf;
use std::sync::Arc;

use treesync_core::Clock;

use crate::cache_policy::LruCachePolicy;
use crate::default_manager::DefaultPersistenceManager;
use crate::error::{PersistenceError, PersistenceResult};
use crate::file::FileStorageEngine;
use crate::manager::PersistenceManager;
use crate::memory::InMemoryStorageEngine;
use crate::noop::NoopPersistenceManager;

const MIB: u64 = 1024 * 1024;

/// Smallest accepted cache budget.
pub const MIN_CACHE_SIZE_BYTES: u64 = MIB;
/// Largest accepted cache budget.
pub const MAX_CACHE_SIZE_BYTES: u64 = 100 * MIB;

/// Thresholds for the LRU cache policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte budget for the server cache.
    pub max_size_bytes: u64,

    /// Server updates between two measurements of the cache size.
    pub server_updates_between_size_checks: u64,

    /// Prunable (inactive) queries tolerated before pruning.
    pub max_prunable_queries_to_keep: u64,

    /// Fraction of prunable queries evicted per pass.
    pub percent_of_queries_to_prune_at_once: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * MIB,
            server_updates_between_size_checks: 1000,
            max_prunable_queries_to_keep: 1000,
            percent_of_queries_to_prune_at_once: 0.2,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the byte budget.
    #[must_use]
    pub const fn max_size_bytes(mut self, value: u64) -> Self {
        self.max_size_bytes = value;
        self
    }

    /// Sets how many server updates pass between size checks.
    #[must_use]
    pub const fn server_updates_between_size_checks(mut self, value: u64) -> Self {
        self.server_updates_between_size_checks = value;
        self
    }

    /// Sets how many prunable queries are tolerated.
    #[must_use]
    pub const fn max_prunable_queries_to_keep(mut self, value: u64) -> Self {
        self.max_prunable_queries_to_keep = value;
        self
    }

    /// Sets the fraction of prunable queries evicted per pass.
    #[must_use]
    pub const fn percent_of_queries_to_prune_at_once(mut self, value: f64) -> Self {
        self.percent_of_queries_to_prune_at_once = value;
        self
    }

    /// Checks that every threshold is in range.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidConfig`] if the byte budget is
    /// outside 1 MiB..=100 MiB or the prune fraction is outside (0, 1].
    pub fn validate(&self) -> PersistenceResult<()> {
        if !(MIN_CACHE_SIZE_BYTES..=MAX_CACHE_SIZE_BYTES).contains(&self.max_size_bytes) {
            return Err(PersistenceError::invalid_config(format!(
                "cache size must be between {MIN_CACHE_SIZE_BYTES} and {MAX_CACHE_SIZE_BYTES} bytes, got {}",
                self.max_size_bytes
            )));
        }
        let pct = self.percent_of_queries_to_prune_at_once;
        if !(pct > 0.0 && pct <= 1.0) {
            return Err(PersistenceError::invalid_config(format!(
                "prune fraction must be in (0, 1], got {pct}"
            )));
        }
        Ok(())
    }
}

/// Whether and where the local cache is kept.
#[derive(Debug, Clone, Default)]
pub struct PersistenceConfig {
    /// Whether anything is persisted at all.
    pub enabled: bool,

    /// Eviction thresholds.
    pub cache: CacheConfig,

    /// Directory for the cache file. Without one the cache lives in memory.
    pub path: Option<PathBuf>,
}

impl PersistenceConfig {
    /// Creates a disabled configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether persistence is enabled.
    #[must_use]
    pub fn enabled(mut self, value: bool) -> Self {
        self.enabled = value;
        self
    }

    /// Sets the eviction thresholds.
    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Keeps the cache in `path`.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Validates the configuration and builds the matching manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the thresholds are out of range or the cache
    /// directory cannot be opened.
    pub fn build_manager(&self, clock: Arc<dyn Clock>) -> PersistenceResult<Arc<dyn PersistenceManager>> {
        if !self.enabled {
            return Ok(Arc::new(NoopPersistenceManager::new()));
        }
        self.cache.validate()?;
        let policy = Box::new(LruCachePolicy::from_config(&self.cache));
        let manager = match &self.path {
            Some(path) => DefaultPersistenceManager::new(
                Box::new(FileStorageEngine::open(path)?),
                policy,
                clock,
            )?,
            None => DefaultPersistenceManager::new(
                Box::new(InMemoryStorageEngine::new()),
                policy,
                clock,
            )?,
        };
        Ok(Arc::new(manager))
    }
}
