//! Persistence manager backed by a storage engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use treesync_core::{
    CacheNode, ChildKey, Clock, CompoundWrite, IndexedNode, Node, Path, QuerySpec, UserWriteRecord,
    WriteId,
};

use crate::cache_policy::CachePolicy;
use crate::engine::PersistenceStorageEngine;
use crate::error::PersistenceResult;
use crate::manager::{PersistenceManager, TransactionGuard};
use crate::tracked_query_manager::TrackedQueryManager;

#[derive(Debug)]
struct Inner {
    storage: Box<dyn PersistenceStorageEngine>,
    tracked: TrackedQueryManager,
    policy: Box<dyn CachePolicy>,
    updates_since_prune_check: u64,
}

impl Inner {
    fn tracked_query_id(&self, query: &QuerySpec) -> u64 {
        assert!(
            !query.loads_all_data(),
            "tracked keys are only kept for filtered queries: {query}"
        );
        let tracked = self.tracked.find(query);
        assert!(
            tracked.is_some_and(|tracked| tracked.active),
            "tracked keys require an active tracked query: {query}"
        );
        tracked.map_or(0, |tracked| tracked.id)
    }

    fn apply_user_write(&mut self, path: &Path, node: &Node) -> PersistenceResult<()> {
        if self.tracked.has_active_default_query(path) {
            return Ok(());
        }
        self.storage.overwrite_server_cache(path, node)?;
        self.tracked
            .ensure_complete_tracked_query(self.storage.as_mut(), path)
    }

    fn set_query_complete(&mut self, query: &QuerySpec) -> PersistenceResult<()> {
        if query.loads_all_data() {
            self.tracked.set_queries_complete(self.storage.as_mut(), query.path())
        } else {
            self.tracked
                .set_query_complete_if_exists(self.storage.as_mut(), query)
        }
    }

    fn prune_check_after_server_update(&mut self) -> PersistenceResult<()> {
        self.updates_since_prune_check += 1;
        if !self.policy.should_check_cache_size(self.updates_since_prune_check) {
            return Ok(());
        }
        debug!(updates = self.updates_since_prune_check, "reached prune check threshold");
        self.updates_since_prune_check = 0;

        let mut cache_size = self.storage.server_cache_estimated_size_in_bytes()?;
        debug!(cache_size, "cache size before pruning");
        while self
            .policy
            .should_prune(cache_size, self.tracked.count_of_prunable_queries())
        {
            let forest = self
                .tracked
                .prune_old_queries(self.storage.as_mut(), self.policy.as_ref())?;
            if !forest.prunes_anything() {
                break;
            }
            self.storage.prune_cache(&Path::empty(), &forest)?;
            cache_size = self.storage.server_cache_estimated_size_in_bytes()?;
            debug!(cache_size, "cache size after pruning");
        }
        Ok(())
    }
}

/// Persists writes, server data and tracked queries through a
/// [`PersistenceStorageEngine`], evicting under a [`CachePolicy`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use treesync_core::{ManualClock, Node, Path, QuerySpec};
/// use treesync_persistence::{
///     DefaultPersistenceManager, InMemoryStorageEngine, NoCachePolicy, PersistenceManager,
/// };
///
/// let manager = DefaultPersistenceManager::new(
///     Box::new(InMemoryStorageEngine::new()),
///     Box::new(NoCachePolicy),
///     Arc::new(ManualClock::new(0)),
/// )
/// .unwrap();
/// let query = QuerySpec::default_at(Path::parse("a").unwrap());
/// manager
///     .run_in_transaction(&mut || {
///         manager.set_query_active(&query)?;
///         manager.update_server_cache(&query, &Node::from(1_i64))
///     })
///     .unwrap();
/// assert!(manager.server_cache(&query).unwrap().is_fully_initialized());
/// ```
#[derive(Debug)]
pub struct DefaultPersistenceManager {
    inner: Mutex<Inner>,
    guard: TransactionGuard,
}

impl DefaultPersistenceManager {
    /// Builds a manager over `storage`, loading its tracked queries.
    ///
    /// # Errors
    ///
    /// Returns an error if tracked queries cannot be loaded.
    pub fn new(
        mut storage: Box<dyn PersistenceStorageEngine>,
        policy: Box<dyn CachePolicy>,
        clock: Arc<dyn Clock>,
    ) -> PersistenceResult<Self> {
        let tracked = TrackedQueryManager::new(storage.as_mut(), clock)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                storage,
                tracked,
                policy,
                updates_since_prune_check: 0,
            }),
            guard: TransactionGuard::default(),
        })
    }

    /// Flushes and releases the storage engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot flush.
    pub fn close(&self) -> PersistenceResult<()> {
        self.inner.lock().storage.close()
    }
}

impl PersistenceManager for DefaultPersistenceManager {
    fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().storage.save_user_overwrite(path, node, write_id)
    }

    fn save_user_merge(&self, path: &Path, children: &CompoundWrite, write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().storage.save_user_merge(path, children, write_id)
    }

    fn remove_user_write(&self, write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().storage.remove_user_write(write_id)
    }

    fn remove_all_user_writes(&self) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().storage.remove_all_user_writes()
    }

    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>> {
        self.inner.lock().storage.load_user_writes()
    }

    fn apply_user_write_to_server_cache(&self, path: &Path, node: &Node) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().apply_user_write(path, node)
    }

    fn apply_user_merge_to_server_cache(&self, path: &Path, children: &CompoundWrite) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        for (relative, node) in children.entries() {
            inner.apply_user_write(&path.join(&relative), &node)?;
        }
        Ok(())
    }

    fn server_cache(&self, query: &QuerySpec) -> PersistenceResult<CacheNode> {
        let inner = self.inner.lock();
        let (complete, tracked_keys) = if inner.tracked.is_query_complete(query) {
            let keys = match inner.tracked.find(query) {
                Some(tracked) if !query.loads_all_data() && tracked.complete => {
                    Some(inner.storage.load_tracked_query_keys(tracked.id)?)
                }
                _ => None,
            };
            (true, keys)
        } else {
            let keys = inner
                .tracked
                .known_complete_children(inner.storage.as_ref(), query.path())?;
            (false, Some(keys))
        };

        let cached = inner.storage.server_cache(query.path())?;
        trace!(query = %query, complete, "read server cache");
        Ok(match tracked_keys {
            Some(keys) => {
                let filtered = keys.iter().fold(Node::empty(), |node, key| {
                    node.update_immediate_child(key, cached.immediate_child(key))
                });
                CacheNode::new(IndexedNode::new(filtered, query.index().clone()), complete, true)
            }
            None => CacheNode::new(IndexedNode::new(cached, query.index().clone()), complete, false),
        })
    }

    fn update_server_cache(&self, query: &QuerySpec, node: &Node) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        if query.loads_all_data() {
            inner.storage.overwrite_server_cache(query.path(), node)?;
        } else {
            inner.storage.merge_into_server_cache(query.path(), node)?;
        }
        inner.set_query_complete(query)?;
        inner.prune_check_after_server_update()
    }

    fn update_server_cache_with_merge(&self, path: &Path, children: &CompoundWrite) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        inner.storage.merge_write_into_server_cache(path, children)?;
        inner.prune_check_after_server_update()
    }

    fn set_query_active(&self, query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        let Inner { storage, tracked, .. } = &mut *inner;
        tracked.set_query_active(storage.as_mut(), query)
    }

    fn set_query_inactive(&self, query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        let Inner { storage, tracked, .. } = &mut *inner;
        tracked.set_query_inactive(storage.as_mut(), query)
    }

    fn set_query_complete(&self, query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        self.inner.lock().set_query_complete(query)
    }

    fn set_tracked_query_keys(&self, query: &QuerySpec, keys: &BTreeSet<ChildKey>) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        let id = inner.tracked_query_id(query);
        inner.storage.save_tracked_query_keys(id, keys)
    }

    fn update_tracked_query_keys(
        &self,
        query: &QuerySpec,
        added: &BTreeSet<ChildKey>,
        removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()> {
        self.guard.verify_inside();
        let mut inner = self.inner.lock();
        let id = inner.tracked_query_id(query);
        inner.storage.update_tracked_query_keys(id, added, removed)
    }

    fn run_in_transaction(&self, body: &mut dyn FnMut() -> PersistenceResult<()>) -> PersistenceResult<()> {
        let _active = self.guard.enter();
        self.inner.lock().storage.begin_transaction();
        let result = body();
        let mut inner = self.inner.lock();
        if result.is_ok() {
            inner.storage.set_transaction_successful();
        }
        let committed = inner.storage.end_transaction();
        result.and(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_policy::{LruCachePolicy, NoCachePolicy};
    use crate::config::CacheConfig;
    use crate::error::PersistenceError;
    use crate::memory::InMemoryStorageEngine;
    use serde_json::json;
    use treesync_core::{ManualClock, QueryParams};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn n(value: serde_json::Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn manager_with(policy: Box<dyn CachePolicy>) -> (DefaultPersistenceManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1));
        let manager =
            DefaultPersistenceManager::new(Box::new(InMemoryStorageEngine::new()), policy, clock.clone())
                .unwrap();
        (manager, clock)
    }

    fn manager() -> DefaultPersistenceManager {
        manager_with(Box::new(NoCachePolicy)).0
    }

    fn tx(manager: &DefaultPersistenceManager, mut body: impl FnMut() -> PersistenceResult<()>) {
        manager.run_in_transaction(&mut body).unwrap();
    }

    #[test]
    fn limited_query_reports_only_tracked_children() {
        let manager = manager();
        let root = QuerySpec::default_at(p("list"));
        let window = QuerySpec::new(p("list"), QueryParams::new().limit_to_first(2));
        let last_three = QuerySpec::new(p("list"), QueryParams::new().limit_to_last(3));
        let keys: BTreeSet<ChildKey> = ["a", "b"].into_iter().map(ChildKey::new).collect();

        tx(&manager, || {
            manager.set_query_active(&root)?;
            manager.update_server_cache(&root, &n(json!({"a": 1, "b": 2, "c": 3, "d": 4})))?;
            manager.set_query_inactive(&root)?;
            manager.set_query_active(&window)?;
            manager.set_tracked_query_keys(&window, &keys)?;
            manager.set_query_complete(&window)
        });
        // Forget that the whole location was complete.
        tx(&manager, || {
            let mut inner = manager.inner.lock();
            let Inner { storage, tracked, .. } = &mut *inner;
            tracked.remove(storage.as_mut(), &root)
        });

        let cache = manager.server_cache(&last_three).unwrap();
        assert!(!cache.is_fully_initialized());
        assert!(cache.is_filtered());
        assert_eq!(cache.node().to_json(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn complete_default_query_is_fully_initialized() {
        let manager = manager();
        let query = QuerySpec::default_at(p("a"));
        tx(&manager, || {
            manager.set_query_active(&query)?;
            manager.update_server_cache(&query, &n(json!({"x": 1})))
        });
        let cache = manager.server_cache(&query).unwrap();
        assert!(cache.is_fully_initialized());
        assert!(!cache.is_filtered());

        let child = QuerySpec::default_at(p("a/x"));
        assert!(manager.server_cache(&child).unwrap().is_fully_initialized());
        assert!(!manager
            .server_cache(&QuerySpec::default_at(p("b")))
            .unwrap()
            .is_fully_initialized());
    }

    #[test]
    fn user_writes_fold_into_cache_without_active_default() {
        let manager = manager();
        tx(&manager, || manager.apply_user_write_to_server_cache(&p("w"), &n(json!(5))));
        let cache = manager.server_cache(&QuerySpec::default_at(p("w"))).unwrap();
        assert!(cache.is_fully_initialized());
        assert_eq!(cache.node(), &n(json!(5)));

        let listened = QuerySpec::default_at(p("live"));
        tx(&manager, || {
            manager.set_query_active(&listened)?;
            manager.apply_user_write_to_server_cache(&p("live/x"), &n(json!(1)))
        });
        assert!(manager.server_cache(&listened).unwrap().node().is_empty());
    }

    #[test]
    fn merges_apply_per_entry() {
        let manager = manager();
        let merge = CompoundWrite::from_path_merge(vec![(p("a"), n(json!(1))), (p("b/c"), n(json!(2)))]);
        tx(&manager, || manager.apply_user_merge_to_server_cache(&p("m"), &merge));
        // Only `a` is a complete child of `m`; `b` is known just at `b/c`.
        let cache = manager.server_cache(&QuerySpec::default_at(p("m"))).unwrap();
        assert_eq!(cache.node().to_json(), json!({"a": 1}));
        assert!(!cache.is_fully_initialized());
        assert!(manager
            .server_cache(&QuerySpec::default_at(p("m/b/c")))
            .unwrap()
            .is_fully_initialized());
    }

    #[test]
    fn write_log_roundtrip() {
        let manager = manager();
        tx(&manager, || {
            manager.save_user_overwrite(&p("a"), &n(json!(1)), WriteId::new(1))?;
            manager.save_user_merge(
                &p("b"),
                &CompoundWrite::from_path_merge(vec![(p("c"), n(json!(2)))]),
                WriteId::new(2),
            )
        });
        assert_eq!(manager.load_user_writes().unwrap().len(), 2);
        tx(&manager, || manager.remove_user_write(WriteId::new(1)));
        assert_eq!(manager.load_user_writes().unwrap()[0].write_id(), WriteId::new(2));
        tx(&manager, || manager.remove_all_user_writes());
        assert!(manager.load_user_writes().unwrap().is_empty());
    }

    #[test]
    fn failed_body_rolls_back() {
        let manager = manager();
        let result = manager.run_in_transaction(&mut || {
            manager.save_user_overwrite(&p("a"), &n(json!(1)), WriteId::new(1))?;
            Err(PersistenceError::corrupted("boom"))
        });
        assert!(result.is_err());
        assert!(manager.load_user_writes().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn nested_transactions_panic() {
        let manager = manager();
        let _ = manager.run_in_transaction(&mut || manager.run_in_transaction(&mut || Ok(())));
    }

    #[test]
    #[should_panic(expected = "expected to already be in progress")]
    fn mutation_outside_transaction_panics() {
        let manager = manager();
        let _ = manager.remove_all_user_writes();
    }

    #[test]
    fn typed_transactions_return_values() {
        let manager = manager();
        let dyn_manager: &dyn PersistenceManager = &manager;
        let value = dyn_manager
            .in_transaction(|| {
                manager.save_user_overwrite(&p("a"), &n(json!(1)), WriteId::new(3))?;
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn lru_pass_evicts_two_oldest_of_ten() {
        // Prune once more than eight inactive queries are cached.
        let config = CacheConfig::new()
            .server_updates_between_size_checks(0)
            .max_prunable_queries_to_keep(8);
        let (manager, clock) = manager_with(Box::new(LruCachePolicy::from_config(&config)));

        for i in 0..10 {
            clock.set(100 + i);
            let query = QuerySpec::default_at(p(&format!("q{i}")));
            tx(&manager, || {
                manager.set_query_active(&query)?;
                manager.set_query_inactive(&query)?;
                manager.set_query_complete(&query)?;
                manager.apply_user_write_to_server_cache(query.path(), &n(json!({"v": i})))
            });
        }
        let trigger = QuerySpec::default_at(p("trigger"));
        tx(&manager, || {
            manager.set_query_active(&trigger)?;
            manager.update_server_cache(&trigger, &n(json!(true)))
        });

        for (i, expect_present) in [(0, false), (1, false), (2, true), (9, true)] {
            let cache = manager
                .server_cache(&QuerySpec::default_at(p(&format!("q{i}"))))
                .unwrap();
            assert_eq!(!cache.node().is_empty(), expect_present, "q{i}");
        }
        assert_eq!(manager.inner.lock().tracked.count_of_prunable_queries(), 8);
    }
}
