//! In-memory storage engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;
use treesync_core::{
    ChildKey, CompoundWrite, Node, Path, StoredUserWrite, UserWriteRecord, WriteId,
};

use crate::engine::PersistenceStorageEngine;
use crate::error::PersistenceResult;
use crate::prune_forest::PruneForest;
use crate::tracked_query::TrackedQuery;

/// Everything an engine stores. Also the on-disk format of the file engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub(crate) server_cache: Node,
    #[serde(default)]
    pub(crate) user_writes: Vec<StoredUserWrite>,
    #[serde(default)]
    pub(crate) tracked_queries: BTreeMap<u64, TrackedQuery>,
    #[serde(default)]
    pub(crate) tracked_keys: BTreeMap<u64, BTreeSet<ChildKey>>,
}

/// An engine that keeps everything in memory.
///
/// Suitable for:
/// - Unit and integration tests
/// - Sessions that want the tracked-query machinery without touching disk
///
/// Transactions snapshot the whole state when they begin and restore the
/// snapshot unless they were marked successful.
///
/// # Example
///
/// ```rust
/// use treesync_core::{Node, Path};
/// use treesync_persistence::{InMemoryStorageEngine, PersistenceStorageEngine};
///
/// let mut engine = InMemoryStorageEngine::new();
/// let path = Path::parse("a/b").unwrap();
/// engine.overwrite_server_cache(&path, &Node::from(1_i64)).unwrap();
/// assert_eq!(engine.server_cache(&path).unwrap(), Node::from(1_i64));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStorageEngine {
    state: StoreState,
    snapshot: Option<StoreState>,
    successful: bool,
}

impl InMemoryStorageEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: StoreState) -> Self {
        Self {
            state,
            snapshot: None,
            successful: false,
        }
    }

    pub(crate) fn state(&self) -> &StoreState {
        &self.state
    }

    /// True while a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn save_write(&mut self, stored: StoredUserWrite) {
        let writes = &mut self.state.user_writes;
        match writes.binary_search_by_key(&stored.id, |w| w.id) {
            Ok(existing) => writes[existing] = stored,
            Err(position) => writes.insert(position, stored),
        }
    }
}

/// Rebuilds `node` keeping only what `forest` does not prune.
fn prune_node(node: &Node, forest: &PruneForest) -> Node {
    if node.is_empty() {
        return node.clone();
    }
    let here = Path::empty();
    if forest.should_prune_unkept_descendants(&here) {
        return forest.fold_kept_nodes(Node::empty(), |kept, acc| {
            acc.update_child(kept, node.child(kept))
        });
    }
    if forest.should_keep(&here) {
        return node.clone();
    }
    let keys: Vec<ChildKey> = node.children().map(|(key, _)| key.clone()).collect();
    keys.into_iter().fold(node.clone(), |acc, key| {
        let child_forest = forest.child(&key);
        if !child_forest.affects_path(&here) {
            return acc;
        }
        let pruned = prune_node(&acc.immediate_child(&key), &child_forest);
        acc.update_immediate_child(&key, pruned)
    })
}

impl PersistenceStorageEngine for InMemoryStorageEngine {
    fn save_user_overwrite(&mut self, path: &Path, node: &Node, write_id: WriteId) -> PersistenceResult<()> {
        let record = UserWriteRecord::overwrite(write_id, path.clone(), node.clone(), true);
        self.save_write(StoredUserWrite::from(&record));
        Ok(())
    }

    fn save_user_merge(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
        write_id: WriteId,
    ) -> PersistenceResult<()> {
        let record = UserWriteRecord::merge(write_id, path.clone(), children.clone());
        self.save_write(StoredUserWrite::from(&record));
        Ok(())
    }

    fn remove_user_write(&mut self, write_id: WriteId) -> PersistenceResult<()> {
        self.state.user_writes.retain(|w| w.id != write_id);
        Ok(())
    }

    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>> {
        Ok(self
            .state
            .user_writes
            .iter()
            .cloned()
            .map(UserWriteRecord::from)
            .collect())
    }

    fn remove_all_user_writes(&mut self) -> PersistenceResult<()> {
        self.state.user_writes.clear();
        Ok(())
    }

    fn server_cache(&self, path: &Path) -> PersistenceResult<Node> {
        Ok(self.state.server_cache.child(path))
    }

    fn overwrite_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()> {
        self.state.server_cache = self.state.server_cache.update_child(path, node.clone());
        Ok(())
    }

    fn merge_into_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()> {
        for (key, child) in node.children() {
            self.state.server_cache = self
                .state
                .server_cache
                .update_child(&path.child(key), child.clone());
        }
        Ok(())
    }

    fn merge_write_into_server_cache(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
    ) -> PersistenceResult<()> {
        for (relative, node) in children.entries() {
            self.state.server_cache = self
                .state
                .server_cache
                .update_child(&path.join(&relative), node);
        }
        Ok(())
    }

    fn server_cache_estimated_size_in_bytes(&self) -> PersistenceResult<u64> {
        let encoded = serde_json::to_vec(&self.state.server_cache.to_export_json())?;
        Ok(encoded.len() as u64)
    }

    fn save_tracked_query(&mut self, query: &TrackedQuery) -> PersistenceResult<()> {
        self.state.tracked_queries.insert(query.id, query.clone());
        Ok(())
    }

    fn delete_tracked_query(&mut self, id: u64) -> PersistenceResult<()> {
        self.state.tracked_queries.remove(&id);
        self.state.tracked_keys.remove(&id);
        Ok(())
    }

    fn load_tracked_queries(&self) -> PersistenceResult<Vec<TrackedQuery>> {
        Ok(self.state.tracked_queries.values().cloned().collect())
    }

    fn reset_previously_active_tracked_queries(&mut self, last_use: i64) -> PersistenceResult<()> {
        for query in self.state.tracked_queries.values_mut() {
            if query.active {
                query.active = false;
                query.last_use = last_use;
            }
        }
        Ok(())
    }

    fn save_tracked_query_keys(&mut self, id: u64, keys: &BTreeSet<ChildKey>) -> PersistenceResult<()> {
        self.state.tracked_keys.insert(id, keys.clone());
        Ok(())
    }

    fn update_tracked_query_keys(
        &mut self,
        id: u64,
        added: &BTreeSet<ChildKey>,
        removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()> {
        let keys = self.state.tracked_keys.entry(id).or_default();
        for key in removed {
            keys.remove(key);
        }
        keys.extend(added.iter().cloned());
        Ok(())
    }

    fn load_tracked_query_keys(&self, id: u64) -> PersistenceResult<BTreeSet<ChildKey>> {
        Ok(self.state.tracked_keys.get(&id).cloned().unwrap_or_default())
    }

    fn load_tracked_query_keys_for(&self, ids: &BTreeSet<u64>) -> PersistenceResult<BTreeSet<ChildKey>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.state.tracked_keys.get(id))
            .flatten()
            .cloned()
            .collect())
    }

    fn prune_cache(&mut self, root: &Path, forest: &PruneForest) -> PersistenceResult<()> {
        if !forest.prunes_anything() {
            return Ok(());
        }
        let before = self.state.server_cache.child(root);
        let after = prune_node(&before, forest);
        debug!(
            root = %root,
            children_before = before.child_count(),
            children_after = after.child_count(),
            "pruned server cache"
        );
        self.state.server_cache = self.state.server_cache.update_child(root, after);
        Ok(())
    }

    fn begin_transaction(&mut self) {
        assert!(
            self.snapshot.is_none(),
            "begin_transaction called while a transaction is already open"
        );
        self.snapshot = Some(self.state.clone());
        self.successful = false;
    }

    fn set_transaction_successful(&mut self) {
        self.successful = true;
    }

    fn end_transaction(&mut self) -> PersistenceResult<()> {
        let snapshot = self.snapshot.take();
        assert!(snapshot.is_some(), "end_transaction called without an open transaction");
        if !self.successful {
            if let Some(snapshot) = snapshot {
                self.state = snapshot;
            }
        }
        self.successful = false;
        Ok(())
    }

    fn close(&mut self) -> PersistenceResult<()> {
        Ok(())
    }
}
