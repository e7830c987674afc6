//! Persistence manager used when caching is disabled.

use std::collections::BTreeSet;

use treesync_core::{
    CacheNode, ChildKey, CompoundWrite, IndexedNode, Node, Path, QuerySpec, UserWriteRecord, WriteId,
};

use crate::error::PersistenceResult;
use crate::manager::{PersistenceManager, TransactionGuard};

/// Stores nothing, but enforces the same transaction rules as
/// [`crate::DefaultPersistenceManager`] so misuse is caught either way.
#[derive(Debug, Default)]
pub struct NoopPersistenceManager {
    guard: TransactionGuard,
}

impl NoopPersistenceManager {
    /// Creates the manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceManager for NoopPersistenceManager {
    fn save_user_overwrite(&self, _path: &Path, _node: &Node, _write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn save_user_merge(&self, _path: &Path, _children: &CompoundWrite, _write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn remove_user_write(&self, _write_id: WriteId) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn remove_all_user_writes(&self) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>> {
        Ok(Vec::new())
    }

    fn apply_user_write_to_server_cache(&self, _path: &Path, _node: &Node) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn apply_user_merge_to_server_cache(&self, _path: &Path, _children: &CompoundWrite) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn server_cache(&self, query: &QuerySpec) -> PersistenceResult<CacheNode> {
        Ok(CacheNode::new(
            IndexedNode::new(Node::empty(), query.index().clone()),
            false,
            false,
        ))
    }

    fn update_server_cache(&self, _query: &QuerySpec, _node: &Node) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn update_server_cache_with_merge(&self, _path: &Path, _children: &CompoundWrite) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn set_query_active(&self, _query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn set_query_inactive(&self, _query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn set_query_complete(&self, _query: &QuerySpec) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn set_tracked_query_keys(&self, _query: &QuerySpec, _keys: &BTreeSet<ChildKey>) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn update_tracked_query_keys(
        &self,
        _query: &QuerySpec,
        _added: &BTreeSet<ChildKey>,
        _removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()> {
        self.guard.verify_inside();
        Ok(())
    }

    fn run_in_transaction(&self, body: &mut dyn FnMut() -> PersistenceResult<()>) -> PersistenceResult<()> {
        let _active = self.guard.enter();
        body()
    }
}
