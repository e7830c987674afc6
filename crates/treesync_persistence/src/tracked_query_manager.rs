//! Tracks which cached queries are complete, active and recently used.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;
use treesync_core::{ChildKey, Clock, ImmutableTree, Path, QueryParams, QuerySpec};

use crate::cache_policy::CachePolicy;
use crate::engine::PersistenceStorageEngine;
use crate::error::PersistenceResult;
use crate::prune_forest::PruneForest;
use crate::tracked_query::{assert_valid_tracked_query, TrackedQuery};

type QueriesAtPath = HashMap<QueryParams, TrackedQuery>;

fn has_default_complete(queries: &QueriesAtPath) -> bool {
    queries
        .get(&QueryParams::default())
        .is_some_and(|query| query.complete)
}

fn has_active_default(queries: &QueriesAtPath) -> bool {
    queries
        .get(&QueryParams::default())
        .is_some_and(|query| query.active)
}

/// Maps a query that loads all data to the default query at its path.
fn normalize(query: &QuerySpec) -> QuerySpec {
    if query.loads_all_data() {
        QuerySpec::default_at(query.path().clone())
    } else {
        query.clone()
    }
}

/// In-memory index of tracked queries, mirrored to a storage engine.
///
/// Every method that changes a tracked query writes it through to the
/// engine it is handed; the caller is responsible for the transaction.
#[derive(Debug)]
pub struct TrackedQueryManager {
    tree: ImmutableTree<QueriesAtPath>,
    next_id: u64,
    clock: Arc<dyn Clock>,
}

impl TrackedQueryManager {
    /// Loads tracked queries from `storage`, first marking every query
    /// that was active in a previous session as inactive.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be read or updated.
    pub fn new(storage: &mut dyn PersistenceStorageEngine, clock: Arc<dyn Clock>) -> PersistenceResult<Self> {
        storage.begin_transaction();
        let reset = storage.reset_previously_active_tracked_queries(clock.millis());
        if reset.is_ok() {
            storage.set_transaction_successful();
        }
        storage.end_transaction()?;
        reset?;

        let mut manager = Self {
            tree: ImmutableTree::empty(),
            next_id: 0,
            clock,
        };
        for query in storage.load_tracked_queries()? {
            manager.next_id = manager.next_id.max(query.id + 1);
            manager.cache(query);
        }
        Ok(manager)
    }

    /// The tracked record for `query`, if any.
    #[must_use]
    pub fn find(&self, query: &QuerySpec) -> Option<&TrackedQuery> {
        let query = normalize(query);
        self.tree.get(query.path())?.get(query.params())
    }

    /// Stops tracking `query`.
    ///
    /// # Panics
    ///
    /// Panics if the query is not tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn remove(&mut self, storage: &mut dyn PersistenceStorageEngine, query: &QuerySpec) -> PersistenceResult<()> {
        let query = normalize(query);
        let tracked = self.find(&query);
        assert!(tracked.is_some(), "tracked query must exist to be removed: {query}");
        if let Some(tracked) = tracked {
            storage.delete_tracked_query(tracked.id)?;
        }
        let mut at_path = self.tree.get(query.path()).cloned().unwrap_or_default();
        at_path.remove(query.params());
        self.tree = if at_path.is_empty() {
            self.tree.remove(query.path())
        } else {
            self.tree.set(query.path(), at_path)
        };
        Ok(())
    }

    /// Marks `query` active, tracking it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn set_query_active(&mut self, storage: &mut dyn PersistenceStorageEngine, query: &QuerySpec) -> PersistenceResult<()> {
        self.set_query_active_flag(storage, query, true)
    }

    /// Marks `query` inactive.
    ///
    /// # Panics
    ///
    /// Panics if the query is not tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn set_query_inactive(&mut self, storage: &mut dyn PersistenceStorageEngine, query: &QuerySpec) -> PersistenceResult<()> {
        self.set_query_active_flag(storage, query, false)
    }

    fn set_query_active_flag(
        &mut self,
        storage: &mut dyn PersistenceStorageEngine,
        query: &QuerySpec,
        active: bool,
    ) -> PersistenceResult<()> {
        let query = normalize(query);
        let now = self.clock.millis();
        let tracked = match self.find(&query) {
            Some(existing) => existing.update_last_use(now).set_active_state(active),
            None => {
                assert!(active, "setting a query inactive requires it to be tracked: {query}");
                let id = self.allocate_id();
                debug!(id, query = %query, "tracking query");
                TrackedQuery::new(id, query, now, false, active)
            }
        };
        self.save(storage, tracked)
    }

    /// Marks `query` complete if it is tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn set_query_complete_if_exists(
        &mut self,
        storage: &mut dyn PersistenceStorageEngine,
        query: &QuerySpec,
    ) -> PersistenceResult<()> {
        match self.find(query) {
            Some(tracked) if !tracked.complete => {
                let completed = tracked.set_complete();
                self.save(storage, completed)
            }
            _ => Ok(()),
        }
    }

    /// Marks every tracked query at or below `path` complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn set_queries_complete(&mut self, storage: &mut dyn PersistenceStorageEngine, path: &Path) -> PersistenceResult<()> {
        let incomplete: Vec<TrackedQuery> = self
            .tree
            .subtree(path)
            .values()
            .into_iter()
            .flat_map(HashMap::into_values)
            .filter(|query| !query.complete)
            .collect();
        for query in incomplete {
            self.save(storage, query.set_complete())?;
        }
        Ok(())
    }

    /// True if the cached data for `query` is known to be complete.
    #[must_use]
    pub fn is_query_complete(&self, query: &QuerySpec) -> bool {
        if self.included_in_default_complete_query(query.path()) {
            true
        } else if query.loads_all_data() {
            false
        } else {
            self.tree
                .get(query.path())
                .and_then(|queries| queries.get(query.params()))
                .is_some_and(|tracked| tracked.complete)
        }
    }

    /// True if a complete default query covers `path`.
    #[must_use]
    pub fn included_in_default_complete_query(&self, path: &Path) -> bool {
        self.tree
            .find_root_most_matching_path(path, has_default_complete)
            .is_some()
    }

    /// True if an active default query covers `path`.
    #[must_use]
    pub fn has_active_default_query(&self, path: &Path) -> bool {
        self.tree
            .root_most_value_matching(path, has_active_default)
            .is_some()
    }

    /// Children of `path` whose cached data is known to be complete.
    ///
    /// # Errors
    ///
    /// Returns an error if tracked keys cannot be loaded.
    pub fn known_complete_children(
        &self,
        storage: &dyn PersistenceStorageEngine,
        path: &Path,
    ) -> PersistenceResult<BTreeSet<ChildKey>> {
        let ids: BTreeSet<u64> = self
            .tree
            .get(path)
            .map(|queries| {
                queries
                    .values()
                    .filter(|query| query.complete && !query.query.loads_all_data())
                    .map(|query| query.id)
                    .collect()
            })
            .unwrap_or_default();
        let mut children = if ids.is_empty() {
            BTreeSet::new()
        } else {
            storage.load_tracked_query_keys_for(&ids)?
        };
        let subtree = self.tree.subtree(path);
        for (key, child) in subtree.children() {
            if child.value().is_some_and(has_default_complete) {
                children.insert(key.clone());
            }
        }
        Ok(children)
    }

    /// Tracks a complete default query at `path` unless one already
    /// covers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn ensure_complete_tracked_query(
        &mut self,
        storage: &mut dyn PersistenceStorageEngine,
        path: &Path,
    ) -> PersistenceResult<()> {
        if self.included_in_default_complete_query(path) {
            return Ok(());
        }
        let query = QuerySpec::default_at(path.clone());
        let tracked = match self.find(&query) {
            Some(existing) => {
                assert!(!existing.complete, "complete default query should have covered {path}");
                existing.set_complete()
            }
            None => {
                let id = self.allocate_id();
                TrackedQuery::new(id, query, self.clock.millis(), true, false)
            }
        };
        self.save(storage, tracked)
    }

    /// Number of queries that could be evicted.
    #[must_use]
    pub fn count_of_prunable_queries(&self) -> u64 {
        self.matching(|query| !query.active).len() as u64
    }

    /// Evicts the least recently used inactive queries as far as `policy`
    /// asks, and returns the forest describing what to drop from the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn prune_old_queries(
        &mut self,
        storage: &mut dyn PersistenceStorageEngine,
        policy: &dyn CachePolicy,
    ) -> PersistenceResult<PruneForest> {
        let mut prunable = self.matching(|query| !query.active);
        let count_to_prune = count_to_prune(policy, prunable.len() as u64);
        prunable.sort_by_key(|query| query.last_use);

        let mut forest = PruneForest::new();
        let split = usize::try_from(count_to_prune).map_or(prunable.len(), |n| n.min(prunable.len()));
        let (to_prune, to_keep) = prunable.split_at(split);
        for query in to_prune {
            debug!(id = query.id, query = %query.query, "pruning tracked query");
            forest = forest.prune(query.query.path())?;
            self.remove(storage, &query.query)?;
        }
        for query in to_keep {
            forest = forest.keep(query.query.path());
        }
        for query in self.matching(|query| query.active) {
            forest = forest.keep(query.query.path());
        }
        Ok(forest)
    }

    fn matching(&self, predicate: impl Fn(&TrackedQuery) -> bool) -> Vec<TrackedQuery> {
        self.tree
            .values()
            .into_iter()
            .flat_map(HashMap::into_values)
            .filter(|query| predicate(query))
            .collect()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn save(&mut self, storage: &mut dyn PersistenceStorageEngine, query: TrackedQuery) -> PersistenceResult<()> {
        storage.save_tracked_query(&query)?;
        self.cache(query);
        Ok(())
    }

    fn cache(&mut self, query: TrackedQuery) {
        assert_valid_tracked_query(&query.query);
        let mut at_path = self.tree.get(query.query.path()).cloned().unwrap_or_default();
        if let Some(existing) = at_path.get(query.query.params()) {
            assert_eq!(existing.id, query.id, "tracked query id changed");
        }
        let path = query.query.path().clone();
        at_path.insert(query.query.params().clone(), query);
        self.tree = self.tree.set(&path, at_path);
    }
}

/// How many of `prunable` queries one pass evicts.
fn count_to_prune(policy: &dyn CachePolicy, prunable: u64) -> u64 {
    let keep_fraction = 1.0 - policy.percent_of_queries_to_prune_at_once();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let by_fraction = (prunable as f64 * keep_fraction).floor() as u64;
    prunable - by_fraction.min(policy.max_number_of_queries_to_keep()).min(prunable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_policy::LruCachePolicy;
    use crate::memory::InMemoryStorageEngine;
    use treesync_core::ManualClock;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn filtered(path: &str) -> QuerySpec {
        QuerySpec::new(p(path), QueryParams::new().limit_to_first(3))
    }

    fn setup() -> (InMemoryStorageEngine, TrackedQueryManager, Arc<ManualClock>) {
        let mut engine = InMemoryStorageEngine::new();
        let clock = Arc::new(ManualClock::new(1));
        let manager = TrackedQueryManager::new(&mut engine, clock.clone()).unwrap();
        (engine, manager, clock)
    }

    #[test]
    fn loads_all_queries_are_normalized() {
        let (mut engine, mut manager, _) = setup();
        let by_key = QuerySpec::new(p("a"), QueryParams::new().order_by(treesync_core::Index::Key));
        manager.set_query_active(&mut engine, &by_key).unwrap();
        assert!(manager.find(&QuerySpec::default_at(p("a"))).is_some());
        assert!(manager.has_active_default_query(&p("a/b")));
        assert!(!manager.has_active_default_query(&p("b")));
    }

    #[test]
    fn completeness_through_default_ancestor() {
        let (mut engine, mut manager, _) = setup();
        let root = QuerySpec::default_at(p("a"));
        manager.set_query_active(&mut engine, &root).unwrap();
        assert!(!manager.is_query_complete(&filtered("a/b")));
        manager.set_queries_complete(&mut engine, &p("a")).unwrap();
        assert!(manager.is_query_complete(&root));
        assert!(manager.is_query_complete(&filtered("a/b")));
        assert!(!manager.is_query_complete(&QuerySpec::default_at(p("z"))));
    }

    #[test]
    fn filtered_query_completion() {
        let (mut engine, mut manager, _) = setup();
        let query = filtered("q");
        manager.set_query_complete_if_exists(&mut engine, &query).unwrap();
        assert!(manager.find(&query).is_none());
        manager.set_query_active(&mut engine, &query).unwrap();
        manager.set_query_complete_if_exists(&mut engine, &query).unwrap();
        assert!(manager.is_query_complete(&query));
        assert!(!manager.is_query_complete(&QuerySpec::default_at(p("q"))));
    }

    #[test]
    #[should_panic(expected = "requires it to be tracked")]
    fn inactive_requires_tracking() {
        let (mut engine, mut manager, _) = setup();
        manager
            .set_query_inactive(&mut engine, &QuerySpec::default_at(p("x")))
            .unwrap();
    }

    #[test]
    fn known_complete_children_include_defaults_and_keys() {
        let (mut engine, mut manager, _) = setup();
        let query = filtered("p");
        manager.set_query_active(&mut engine, &query).unwrap();
        manager.set_query_complete_if_exists(&mut engine, &query).unwrap();
        let id = manager.find(&query).unwrap().id;
        let keys: BTreeSet<ChildKey> = ["a", "b"].into_iter().map(ChildKey::new).collect();
        engine.save_tracked_query_keys(id, &keys).unwrap();
        manager.ensure_complete_tracked_query(&mut engine, &p("p/c")).unwrap();

        let known: Vec<String> = manager
            .known_complete_children(&engine, &p("p"))
            .unwrap()
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        assert_eq!(known, vec!["a", "b", "c"]);
    }

    #[test]
    fn ensure_complete_is_idempotent_under_complete_default() {
        let (mut engine, mut manager, _) = setup();
        manager.ensure_complete_tracked_query(&mut engine, &p("a")).unwrap();
        manager.ensure_complete_tracked_query(&mut engine, &p("a/b")).unwrap();
        assert!(manager.find(&QuerySpec::default_at(p("a/b"))).is_none());
        assert_eq!(engine.load_tracked_queries().unwrap().len(), 1);
    }

    #[test]
    fn previously_active_queries_are_reset() {
        let mut engine = InMemoryStorageEngine::new();
        let clock = Arc::new(ManualClock::new(10));
        {
            let mut manager = TrackedQueryManager::new(&mut engine, clock.clone()).unwrap();
            manager
                .set_query_active(&mut engine, &QuerySpec::default_at(p("a")))
                .unwrap();
        }
        clock.set(500);
        let manager = TrackedQueryManager::new(&mut engine, clock).unwrap();
        let tracked = manager.find(&QuerySpec::default_at(p("a"))).unwrap();
        assert!(!tracked.active);
        assert_eq!(tracked.last_use, 500);
        assert_eq!(manager.count_of_prunable_queries(), 1);
    }

    #[test]
    fn prunes_oldest_twenty_percent() {
        let (mut engine, mut manager, clock) = setup();
        for i in 0..10 {
            clock.set(100 + i);
            let query = QuerySpec::default_at(p(&format!("q{i}")));
            manager.set_query_active(&mut engine, &query).unwrap();
            manager.set_query_inactive(&mut engine, &query).unwrap();
        }
        let active = QuerySpec::default_at(p("live"));
        manager.set_query_active(&mut engine, &active).unwrap();

        let forest = manager
            .prune_old_queries(&mut engine, &LruCachePolicy::new(1024 * 1024))
            .unwrap();
        assert!(forest.should_prune_unkept_descendants(&p("q0")));
        assert!(forest.should_prune_unkept_descendants(&p("q1")));
        assert!(forest.should_keep(&p("q2")));
        assert!(forest.should_keep(&p("live")));
        assert!(manager.find(&QuerySpec::default_at(p("q0"))).is_none());
        assert!(manager.find(&QuerySpec::default_at(p("q2"))).is_some());
        assert_eq!(manager.count_of_prunable_queries(), 8);
    }

    #[test]
    fn count_to_prune_respects_max_to_keep() {
        let policy = LruCachePolicy::from_config(
            &crate::config::CacheConfig::default().max_prunable_queries_to_keep(3),
        );
        assert_eq!(count_to_prune(&policy, 10), 7);
        assert_eq!(count_to_prune(&LruCachePolicy::new(1024 * 1024), 10), 2);
        assert_eq!(count_to_prune(&LruCachePolicy::new(1024 * 1024), 0), 0);
    }
}
