//! The persistence manager contract.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use treesync_core::{CacheNode, ChildKey, CompoundWrite, Node, Path, QuerySpec, UserWriteRecord, WriteId};

use crate::error::{PersistenceError, PersistenceResult};

/// Records local writes and server data so a tree can be rebuilt after a
/// restart, and keeps the cache within its budget.
///
/// Every mutating method must run inside
/// [`run_in_transaction`](Self::run_in_transaction); calling one outside a
/// transaction, or opening a transaction inside another, is a programming
/// error and panics.
///
/// # Implementors
///
/// - [`crate::DefaultPersistenceManager`] - Backed by a storage engine
/// - [`crate::NoopPersistenceManager`] - Persistence disabled
pub trait PersistenceManager: Send + Sync + std::fmt::Debug {
    /// Logs an overwrite.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: WriteId) -> PersistenceResult<()>;

    /// Logs a merge.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn save_user_merge(&self, path: &Path, children: &CompoundWrite, write_id: WriteId) -> PersistenceResult<()>;

    /// Drops an acknowledged write from the log.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn remove_user_write(&self, write_id: WriteId) -> PersistenceResult<()>;

    /// Empties the write log.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn remove_all_user_writes(&self) -> PersistenceResult<()>;

    /// Every logged write in write-id order.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>>;

    /// Folds an acknowledged overwrite into the server cache.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn apply_user_write_to_server_cache(&self, path: &Path, node: &Node) -> PersistenceResult<()>;

    /// Folds an acknowledged merge into the server cache.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn apply_user_merge_to_server_cache(&self, path: &Path, children: &CompoundWrite) -> PersistenceResult<()>;

    /// Cached server data for `query`. The result is only marked fully
    /// initialized when tracking proves it complete.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn server_cache(&self, query: &QuerySpec) -> PersistenceResult<CacheNode>;

    /// Stores a complete server result for `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn update_server_cache(&self, query: &QuerySpec, node: &Node) -> PersistenceResult<()>;

    /// Stores a server merge at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn update_server_cache_with_merge(&self, path: &Path, children: &CompoundWrite) -> PersistenceResult<()>;

    /// Records that `query` is listened to.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn set_query_active(&self, query: &QuerySpec) -> PersistenceResult<()>;

    /// Records that `query` is no longer listened to.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn set_query_inactive(&self, query: &QuerySpec) -> PersistenceResult<()>;

    /// Records that the server sent everything `query` covers.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn set_query_complete(&self, query: &QuerySpec) -> PersistenceResult<()>;

    /// Replaces the keys a filtered query currently covers.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn set_tracked_query_keys(&self, query: &QuerySpec, keys: &BTreeSet<ChildKey>) -> PersistenceResult<()>;

    /// Adjusts the keys a filtered query currently covers.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn update_tracked_query_keys(
        &self,
        query: &QuerySpec,
        added: &BTreeSet<ChildKey>,
        removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()>;

    /// Runs `body` as one storage transaction. Changes are committed only
    /// if `body` returns `Ok`.
    ///
    /// # Panics
    ///
    /// Panics if called while another transaction is running.
    ///
    /// # Errors
    ///
    /// Returns the error of `body`, or the storage error raised while
    /// committing.
    fn run_in_transaction(&self, body: &mut dyn FnMut() -> PersistenceResult<()>) -> PersistenceResult<()>;
}

impl dyn PersistenceManager + '_ {
    /// Runs `body` in a transaction and returns its value.
    ///
    /// # Errors
    ///
    /// See [`PersistenceManager::run_in_transaction`].
    pub fn in_transaction<T>(&self, body: impl FnOnce() -> PersistenceResult<T>) -> PersistenceResult<T> {
        let mut body = Some(body);
        let mut result = None;
        self.run_in_transaction(&mut || {
            let body = body.take().ok_or(PersistenceError::TransactionIncomplete)?;
            result = Some(body()?);
            Ok(())
        })?;
        result.ok_or(PersistenceError::TransactionIncomplete)
    }
}

/// Single-flight transaction flag shared by the manager implementations.
///
/// This catches concurrent or re-entrant use; it does not serialize
/// callers.
#[derive(Debug, Default)]
pub(crate) struct TransactionGuard {
    active: AtomicBool,
}

impl TransactionGuard {
    /// Marks a transaction as running until the returned token drops.
    pub(crate) fn enter(&self) -> ActiveTransaction<'_> {
        let was_active = self.active.swap(true, Ordering::AcqRel);
        assert!(
            !was_active,
            "run_in_transaction called when an existing transaction is already in progress"
        );
        ActiveTransaction { guard: self }
    }

    /// Panics unless a transaction is running.
    pub(crate) fn verify_inside(&self) {
        assert!(
            self.active.load(Ordering::Acquire),
            "transaction expected to already be in progress"
        );
    }
}

pub(crate) struct ActiveTransaction<'a> {
    guard: &'a TransactionGuard,
}

impl Drop for ActiveTransaction<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}
