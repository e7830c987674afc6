//! # Treesync Persistence
//!
//! Local cache for treesync.
//!
//! This crate provides:
//! - The storage engine contract ([`PersistenceStorageEngine`]) with an
//!   in-memory and a file-backed engine
//! - Tracked-query bookkeeping that knows which cached data is complete
//! - LRU eviction driven by a [`CachePolicy`] and expressed as a
//!   [`PruneForest`]
//! - The [`PersistenceManager`] contract used by the sync tree, with a
//!   storage-backed and a no-op implementation
//!
//! ## Transactions
//!
//! Every mutating manager call must happen inside
//! [`PersistenceManager::run_in_transaction`]. Transactions never nest;
//! violating either rule is a programming error and panics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache_policy;
mod config;
mod default_manager;
mod engine;
mod error;
mod file;
mod manager;
mod memory;
mod noop;
mod prune_forest;
mod tracked_query;
mod tracked_query_manager;

pub use cache_policy::{CachePolicy, LruCachePolicy, NoCachePolicy};
pub use config::{CacheConfig, PersistenceConfig, MAX_CACHE_SIZE_BYTES, MIN_CACHE_SIZE_BYTES};
pub use default_manager::DefaultPersistenceManager;
pub use engine::PersistenceStorageEngine;
pub use error::{PersistenceError, PersistenceResult};
pub use file::FileStorageEngine;
pub use manager::PersistenceManager;
pub use memory::InMemoryStorageEngine;
pub use noop::NoopPersistenceManager;
pub use prune_forest::PruneForest;
pub use tracked_query::TrackedQuery;
pub use tracked_query_manager::TrackedQueryManager;
