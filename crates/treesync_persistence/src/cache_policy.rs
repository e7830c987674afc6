//! When and how much of the server cache to evict.

use crate::config::CacheConfig;

/// Decides when the cache is pruned and how aggressively.
///
/// Policies are pure: they look at counters handed to them and never
/// mutate anything.
pub trait CachePolicy: Send + Sync + std::fmt::Debug {
    /// True once enough server updates have arrived to justify measuring
    /// the cache.
    fn should_check_cache_size(&self, server_updates_since_last_check: u64) -> bool;

    /// True if the cache is over its byte budget or holds too many
    /// prunable queries.
    fn should_prune(&self, current_size_bytes: u64, count_of_prunable_queries: u64) -> bool;

    /// Fraction of prunable queries evicted in one pass.
    fn percent_of_queries_to_prune_at_once(&self) -> f64;

    /// Upper bound on prunable queries kept after a pass.
    fn max_number_of_queries_to_keep(&self) -> u64;
}

/// Never prunes. Used when persistence is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCachePolicy;

impl CachePolicy for NoCachePolicy {
    fn should_check_cache_size(&self, _server_updates_since_last_check: u64) -> bool {
        false
    }

    fn should_prune(&self, _current_size_bytes: u64, _count_of_prunable_queries: u64) -> bool {
        false
    }

    fn percent_of_queries_to_prune_at_once(&self) -> f64 {
        0.0
    }

    fn max_number_of_queries_to_keep(&self) -> u64 {
        u64::MAX
    }
}

/// Evicts least recently used queries once the cache outgrows its budget.
#[derive(Debug, Clone)]
pub struct LruCachePolicy {
    max_size_bytes: u64,
    server_updates_between_size_checks: u64,
    max_prunable_queries_to_keep: u64,
    percent_of_queries_to_prune_at_once: f64,
}

impl LruCachePolicy {
    /// A policy with the default thresholds and the given byte budget.
    #[must_use]
    pub fn new(max_size_bytes: u64) -> Self {
        Self::from_config(&CacheConfig::default().max_size_bytes(max_size_bytes))
    }

    /// A policy using every threshold from `config`.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes,
            server_updates_between_size_checks: config.server_updates_between_size_checks,
            max_prunable_queries_to_keep: config.max_prunable_queries_to_keep,
            percent_of_queries_to_prune_at_once: config.percent_of_queries_to_prune_at_once,
        }
    }
}

impl CachePolicy for LruCachePolicy {
    fn should_check_cache_size(&self, server_updates_since_last_check: u64) -> bool {
        server_updates_since_last_check > self.server_updates_between_size_checks
    }

    fn should_prune(&self, current_size_bytes: u64, count_of_prunable_queries: u64) -> bool {
        current_size_bytes > self.max_size_bytes
            || count_of_prunable_queries > self.max_prunable_queries_to_keep
    }

    fn percent_of_queries_to_prune_at_once(&self) -> f64 {
        self.percent_of_queries_to_prune_at_once
    }

    fn max_number_of_queries_to_keep(&self) -> u64 {
        self.max_prunable_queries_to_keep
    }
}
