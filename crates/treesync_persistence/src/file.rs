//! File-backed storage engine.
//!
//! The engine owns one directory:
//!
//! ```text
//! <cache_dir>/
//! ├─ LOCK            # Advisory lock for single-owner access
//! └─ cache.json      # Write log, server cache and tracked queries
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};
use treesync_core::{ChildKey, CompoundWrite, Node, Path, UserWriteRecord, WriteId};

use crate::engine::PersistenceStorageEngine;
use crate::error::{PersistenceError, PersistenceResult};
use crate::memory::{InMemoryStorageEngine, StoreState};
use crate::prune_forest::PruneForest;
use crate::tracked_query::TrackedQuery;

const LOCK_FILE: &str = "LOCK";
const CACHE_FILE: &str = "cache.json";
const CACHE_TEMP: &str = "cache.json.tmp";

/// An engine that keeps its state in a directory on disk.
///
/// State is held in memory and written out as a whole after every
/// committed transaction, and after every mutation made outside a
/// transaction. Writes go to a temporary file that is renamed over the
/// cache file, so a crash leaves either the old or the new state.
///
/// Only one engine may own a directory at a time; a second
/// [`FileStorageEngine::open`] fails with [`PersistenceError::Locked`].
#[derive(Debug)]
pub struct FileStorageEngine {
    dir: PathBuf,
    inner: InMemoryStorageEngine,
    dirty: bool,
    _lock_file: File,
}

impl FileStorageEngine {
    /// Opens or creates a cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another engine holds the lock
    /// - The cache file exists but cannot be decoded
    pub fn open(dir: &FsPath) -> PersistenceResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(PersistenceError::Locked);
        }

        let cache_path = dir.join(CACHE_FILE);
        let state = if cache_path.exists() {
            let data = fs::read(&cache_path)?;
            serde_json::from_slice::<StoreState>(&data).map_err(|err| {
                PersistenceError::corrupted(format!("{}: {err}", cache_path.display()))
            })?
        } else {
            StoreState::default()
        };
        debug!(
            dir = %dir.display(),
            writes = state.user_writes.len(),
            tracked_queries = state.tracked_queries.len(),
            "opened cache directory"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: InMemoryStorageEngine::from_state(state),
            dirty: false,
            _lock_file: lock_file,
        })
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &FsPath {
        &self.dir
    }

    /// Writes the state out if it changed and no transaction is open.
    fn persist(&mut self) -> PersistenceResult<()> {
        if self.inner.in_transaction() || !self.dirty {
            return Ok(());
        }
        let temp_path = self.dir.join(CACHE_TEMP);
        let data = serde_json::to_vec(self.inner.state())?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, self.dir.join(CACHE_FILE))?;
        self.sync_directory()?;
        self.dirty = false;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> PersistenceResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> PersistenceResult<()> {
        Ok(())
    }

    fn mutate(
        &mut self,
        op: impl FnOnce(&mut InMemoryStorageEngine) -> PersistenceResult<()>,
    ) -> PersistenceResult<()> {
        op(&mut self.inner)?;
        self.dirty = true;
        self.persist()
    }
}

impl PersistenceStorageEngine for FileStorageEngine {
    fn save_user_overwrite(&mut self, path: &Path, node: &Node, write_id: WriteId) -> PersistenceResult<()> {
        self.mutate(|inner| inner.save_user_overwrite(path, node, write_id))
    }

    fn save_user_merge(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
        write_id: WriteId,
    ) -> PersistenceResult<()> {
        self.mutate(|inner| inner.save_user_merge(path, children, write_id))
    }

    fn remove_user_write(&mut self, write_id: WriteId) -> PersistenceResult<()> {
        self.mutate(|inner| inner.remove_user_write(write_id))
    }

    fn load_user_writes(&self) -> PersistenceResult<Vec<UserWriteRecord>> {
        self.inner.load_user_writes()
    }

    fn remove_all_user_writes(&mut self) -> PersistenceResult<()> {
        self.mutate(InMemoryStorageEngine::remove_all_user_writes)
    }

    fn server_cache(&self, path: &Path) -> PersistenceResult<Node> {
        self.inner.server_cache(path)
    }

    fn overwrite_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()> {
        self.mutate(|inner| inner.overwrite_server_cache(path, node))
    }

    fn merge_into_server_cache(&mut self, path: &Path, node: &Node) -> PersistenceResult<()> {
        self.mutate(|inner| inner.merge_into_server_cache(path, node))
    }

    fn merge_write_into_server_cache(
        &mut self,
        path: &Path,
        children: &CompoundWrite,
    ) -> PersistenceResult<()> {
        self.mutate(|inner| inner.merge_write_into_server_cache(path, children))
    }

    fn server_cache_estimated_size_in_bytes(&self) -> PersistenceResult<u64> {
        self.inner.server_cache_estimated_size_in_bytes()
    }

    fn save_tracked_query(&mut self, query: &TrackedQuery) -> PersistenceResult<()> {
        self.mutate(|inner| inner.save_tracked_query(query))
    }

    fn delete_tracked_query(&mut self, id: u64) -> PersistenceResult<()> {
        self.mutate(|inner| inner.delete_tracked_query(id))
    }

    fn load_tracked_queries(&self) -> PersistenceResult<Vec<TrackedQuery>> {
        self.inner.load_tracked_queries()
    }

    fn reset_previously_active_tracked_queries(&mut self, last_use: i64) -> PersistenceResult<()> {
        self.mutate(|inner| inner.reset_previously_active_tracked_queries(last_use))
    }

    fn save_tracked_query_keys(&mut self, id: u64, keys: &BTreeSet<ChildKey>) -> PersistenceResult<()> {
        self.mutate(|inner| inner.save_tracked_query_keys(id, keys))
    }

    fn update_tracked_query_keys(
        &mut self,
        id: u64,
        added: &BTreeSet<ChildKey>,
        removed: &BTreeSet<ChildKey>,
    ) -> PersistenceResult<()> {
        self.mutate(|inner| inner.update_tracked_query_keys(id, added, removed))
    }

    fn load_tracked_query_keys(&self, id: u64) -> PersistenceResult<BTreeSet<ChildKey>> {
        self.inner.load_tracked_query_keys(id)
    }

    fn load_tracked_query_keys_for(&self, ids: &BTreeSet<u64>) -> PersistenceResult<BTreeSet<ChildKey>> {
        self.inner.load_tracked_query_keys_for(ids)
    }

    fn prune_cache(&mut self, root: &Path, forest: &PruneForest) -> PersistenceResult<()> {
        self.mutate(|inner| inner.prune_cache(root, forest))
    }

    fn begin_transaction(&mut self) {
        self.inner.begin_transaction();
    }

    fn set_transaction_successful(&mut self) {
        self.inner.set_transaction_successful();
    }

    fn end_transaction(&mut self) -> PersistenceResult<()> {
        self.inner.end_transaction()?;
        self.persist()
    }

    fn close(&mut self) -> PersistenceResult<()> {
        if self.inner.in_transaction() {
            warn!(dir = %self.dir.display(), "closing cache with an open transaction");
            self.inner.end_transaction()?;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use treesync_core::QuerySpec;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut engine = FileStorageEngine::open(dir.path()).unwrap();
            engine.begin_transaction();
            engine
                .overwrite_server_cache(&p("a"), &Node::from_json(&json!({"b": 1})).unwrap())
                .unwrap();
            engine
                .save_user_overwrite(&p("w"), &Node::from("x"), WriteId::new(4))
                .unwrap();
            engine
                .save_tracked_query(&TrackedQuery::new(1, QuerySpec::default_at(p("a")), 3, true, false))
                .unwrap();
            engine.set_transaction_successful();
            engine.end_transaction().unwrap();
            engine.close().unwrap();
        }

        let engine = FileStorageEngine::open(dir.path()).unwrap();
        assert_eq!(engine.server_cache(&p("a/b")).unwrap(), Node::from(1_i64));
        assert_eq!(engine.load_user_writes().unwrap()[0].write_id(), WriteId::new(4));
        assert!(engine.load_tracked_queries().unwrap()[0].complete);
    }

    #[test]
    fn failed_transaction_is_not_written() {
        let dir = tempdir().unwrap();
        {
            let mut engine = FileStorageEngine::open(dir.path()).unwrap();
            engine.begin_transaction();
            engine.overwrite_server_cache(&p("a"), &Node::from(1_i64)).unwrap();
            engine.end_transaction().unwrap();
        }
        let engine = FileStorageEngine::open(dir.path()).unwrap();
        assert!(engine.server_cache(&p("a")).unwrap().is_empty());
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStorageEngine::open(dir.path()).unwrap();
        assert!(matches!(
            FileStorageEngine::open(dir.path()),
            Err(PersistenceError::Locked)
        ));
    }

    #[test]
    fn corrupted_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), b"not json").unwrap();
        assert!(matches!(
            FileStorageEngine::open(dir.path()),
            Err(PersistenceError::Corrupted(_))
        ));
    }

    #[test]
    fn writes_outside_transactions_persist_immediately() {
        let dir = tempdir().unwrap();
        {
            let mut engine = FileStorageEngine::open(dir.path()).unwrap();
            engine.overwrite_server_cache(&p("k"), &Node::from(true)).unwrap();
        }
        let engine = FileStorageEngine::open(dir.path()).unwrap();
        assert_eq!(engine.server_cache(&p("k")).unwrap(), Node::from(true));
    }
}
