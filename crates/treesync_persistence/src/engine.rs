//! Storage engine trait definition.

use std::collections::BTreeSet;

use treesync_core::{ChildKey, CompoundWrite, Node, Path, UserWriteRecord, WriteId};

use crate::error::PersistenceResult;
use crate::prune_forest::PruneForest;
use crate::tracked_query::TrackedQuery;

/// Durable storage for the write log, the server cache and tracked-query
/// metadata.
///
/// Engines store what they are told. Deciding what to cache and when to
/// evict belongs to the persistence manager that owns the engine.
///
/// # Transactions
///
/// Mutations between [`begin_transaction`](Self::begin_transaction) and
/// [`end_transaction`](Self::end_transaction) take effect together, and
/// only if [`set_transaction_successful`](Self::set_transaction_successful)
/// was called in between. Transactions do not nest.
///
/// # Implementors
///
/// - [`crate::InMemoryStorageEngine`] - For testing and memory-only caches
/// - [`crate::FileStorageEngine`] - For caches that survive restarts
pub trait PersistenceStorageEngine: Send + std::fmt::Debug {
    /// Appends an overwrite to the write log.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be stored.
    fn save_user_overwrite(&mut self, path: &Path, node: &Node, write_id: WriteId) -> PersistenceResult<()>;

    /// Appends a merge to the write log.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be stored.
    fn save_user_merge(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
        write_id: WriteId,
    ) -> PersistenceResult<()>;

    /// Removes one write from the log. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn remove_user_write(&mut self, write_id: WriteId) -> PersistenceResult<()>;

    /// Every logged write in write-id order.
    ///
    /// # Errors
    ///
    /// Returns an error if stored writes cannot be decoded.
    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>>;

    /// Empties the write log.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn remove_all_user_writes(&mut self) -> PersistenceResult<()>;

    /// The cached server data at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    fn server_cache(&self, path: &Path) -> PersistenceResult<Node>;

    /// Replaces the cached data at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn overwrite_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()>;

    /// Replaces the cached children of `path` that `node` has, leaving the
    /// others in place.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn merge_into_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()>;

    /// Replaces every entry of `children`, rebased under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn merge_write_into_server_cache(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
    ) -> PersistenceResult<()>;

    /// Approximate size of the cached server data.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn server_cache_estimated_size_in_bytes(&self) -> PersistenceResult<u64>;

    /// Inserts or replaces a tracked query.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn save_tracked_query(&mut self, query: &TrackedQuery) -> PersistenceResult<()>;

    /// Deletes a tracked query and its tracked keys.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn delete_tracked_query(&mut self, id: u64) -> PersistenceResult<()>;

    /// Every tracked query in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if stored queries cannot be decoded.
    fn load_tracked_queries(&self) -> PersistenceResult<Vec<TrackedQuery>>;

    /// Marks every active tracked query inactive and stamps it with
    /// `last_use`. Run once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn reset_previously_active_tracked_queries(&mut self, last_use: i64) -> PersistenceResult<()>;

    /// Replaces the key set of a tracked query.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn save_tracked_query_keys(&mut self, id: u64, keys: &BTreeSet<ChildKey>) -> PersistenceResult<()>;

    /// Adds and removes keys from a tracked query's key set.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn update_tracked_query_keys(
        &mut self,
        id: u64,
        added: &BTreeSet<ChildKey>,
        removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()>;

    /// The key set of one tracked query.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn load_tracked_query_keys(&self, id: u64) -> PersistenceResult<BTreeSet<ChildKey>>;

    /// The union of the key sets of several tracked queries.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn load_tracked_query_keys_for(&self, ids: &BTreeSet<u64>) -> PersistenceResult<BTreeSet<ChildKey>>;

    /// Evicts cached data below `root` as marked by `forest`, which is
    /// relative to `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn prune_cache(&mut self, root: &Path, forest: &PruneForest) -> PersistenceResult<()>;

    /// Opens a transaction.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open.
    fn begin_transaction(&mut self);

    /// Marks the open transaction for commit.
    fn set_transaction_successful(&mut self);

    /// Closes the open transaction, committing it if it was marked
    /// successful and rolling it back otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if committed data cannot be made durable.
    fn end_transaction(&mut self) -> PersistenceResult<()>;

    /// Flushes and releases the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    fn close(&mut self) -> PersistenceResult<()>;
}
