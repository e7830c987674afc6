//! The sync tree: every listened location, the pending write log and the
//! bookkeeping that ties them to listens and the local cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use treesync_core::{
    CacheNode, Clock, CompoundWrite, ImmutableTree, IndexedNode, Node, Path, QuerySpec, Tag,
    UserWrite, UserWriteRecord, WriteId,
};
use treesync_persistence::{PersistenceManager, PersistenceResult};

use crate::config::EngineConfig;
use crate::error::{DatabaseError, SyncResult};
use crate::event::{DataEvent, Event, EventRegistration, KeepSyncedRegistration};
use crate::listen::ListenProvider;
use crate::operation::{Operation, OperationSource};
use crate::server_values::ServerValues;
use crate::sync_point::{build_view, SyncPoint};
use crate::view::View;
use crate::write_tree::{WriteTree, WriteTreeRef};

/// Writes replayed from the local cache by
/// [`SyncTree::restore_user_writes`].
#[derive(Debug)]
pub struct RestoredWrites {
    /// The replayed writes, in write-id order, so they can be sent again.
    pub writes: Vec<UserWriteRecord>,
    /// Events raised while replaying.
    pub events: Vec<Event>,
    /// The first write id that is safe to hand out.
    pub next_write_id: WriteId,
}

/// Merges server data and pending local writes into per-query views and
/// raises the events that keep listeners up to date.
///
/// The tree is not internally synchronized: every call must come from the
/// single task that owns it. Each public operation runs inside one
/// persistence transaction and returns the events to raise, in order.
///
/// # Example
///
/// ```rust,ignore
/// let mut tree = SyncTree::new(persistence, Arc::new(OfflineListenProvider));
/// let events = tree.add_event_registration(registration)?;
/// EventRaiser::new().raise_events(events);
/// ```
#[derive(Debug)]
pub struct SyncTree {
    sync_point_tree: ImmutableTree<SyncPoint>,
    pending_write_tree: WriteTree,
    tag_to_query: HashMap<Tag, QuerySpec>,
    query_to_tag: HashMap<QuerySpec, Tag>,
    keep_synced_queries: HashSet<QuerySpec>,
    next_query_tag: u64,
    persistence: Arc<dyn PersistenceManager>,
    listen_provider: Arc<dyn ListenProvider>,
}

impl SyncTree {
    /// Creates an empty tree over an existing persistence manager.
    pub fn new(persistence: Arc<dyn PersistenceManager>, listen_provider: Arc<dyn ListenProvider>) -> Self {
        Self {
            sync_point_tree: ImmutableTree::empty(),
            pending_write_tree: WriteTree::new(),
            tag_to_query: HashMap::new(),
            query_to_tag: HashMap::new(),
            keep_synced_queries: HashSet::new(),
            next_query_tag: 1,
            persistence,
            listen_provider,
        }
    }

    /// Creates a tree with the persistence described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache cannot
    /// be opened.
    pub fn open(
        config: &EngineConfig,
        listen_provider: Arc<dyn ListenProvider>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let persistence = config.persistence.build_manager(clock)?;
        debug!(enabled = config.persistence.enabled, "opened sync tree");
        Ok(Self::new(persistence, listen_provider))
    }

    /// The persistence manager backing this tree.
    pub fn persistence(&self) -> &Arc<dyn PersistenceManager> {
        &self.persistence
    }

    /// The pending local writes, in write-id order.
    pub fn pending_writes(&self) -> &[UserWriteRecord] {
        self.pending_write_tree.writes()
    }

    /// Applies a local overwrite.
    ///
    /// `unresolved` is what gets persisted; `resolved` has server values
    /// filled in and is what listeners see. Invisible writes update state
    /// without raising events.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not greater than every pending write id.
    pub fn apply_user_overwrite(
        &mut self,
        path: &Path,
        unresolved: &Node,
        resolved: Node,
        write_id: WriteId,
        visible: bool,
        persist: bool,
    ) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            if persist {
                self.persistence.save_user_overwrite(path, unresolved, write_id)?;
            }
            self.pending_write_tree
                .add_overwrite(path.clone(), resolved.clone(), write_id, visible);
            if !visible {
                return Ok(Vec::new());
            }
            self.apply_operation_to_sync_points(&Operation::Overwrite {
                source: OperationSource::User,
                path: path.clone(),
                snapshot: resolved,
            })
        })?;
        trace!(path = %path, write = %write_id, events = events.len(), "applied user overwrite");
        Ok(events)
    }

    /// Applies a local multi-location update.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not greater than every pending write id.
    pub fn apply_user_merge(
        &mut self,
        path: &Path,
        unresolved: &CompoundWrite,
        resolved: &CompoundWrite,
        write_id: WriteId,
        persist: bool,
    ) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            if persist {
                self.persistence.save_user_merge(path, unresolved, write_id)?;
            }
            self.pending_write_tree
                .add_merge(path.clone(), resolved.clone(), write_id);
            self.apply_operation_to_sync_points(&Operation::Merge {
                source: OperationSource::User,
                path: path.clone(),
                children: resolved.clone(),
            })
        })?;
        trace!(path = %path, write = %write_id, events = events.len(), "applied user merge");
        Ok(events)
    }

    /// Acknowledges (or, with `revert`, rejects) a pending write.
    ///
    /// An accepted visible write is folded into the cached server data with
    /// its server values resolved against `clock`. Views whose visible data
    /// does not change raise nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    ///
    /// # Panics
    ///
    /// Panics if no pending write has this id.
    pub fn ack_user_write(
        &mut self,
        write_id: WriteId,
        revert: bool,
        persist: bool,
        clock: &dyn Clock,
    ) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events =
            persistence.in_transaction(|| self.ack_user_write_inner(write_id, revert, persist, clock))?;
        debug!(write = %write_id, revert, events = events.len(), "acknowledged user write");
        Ok(events)
    }

    fn ack_user_write_inner(
        &mut self,
        write_id: WriteId,
        revert: bool,
        persist: bool,
        clock: &dyn Clock,
    ) -> PersistenceResult<Vec<Event>> {
        let Some(write) = self.pending_write_tree.write(write_id).cloned() else {
            panic!("acknowledged {write_id}, which is not pending");
        };
        if persist {
            self.persistence.remove_user_write(write_id)?;
        }
        let needs_reevaluation = self.pending_write_tree.remove_write(write_id);

        if write.is_visible() && !revert {
            let server_values = ServerValues::generate(clock);
            let existing = self
                .calc_complete_event_cache(write.path(), &[])
                .unwrap_or_default();
            match write.write() {
                UserWrite::Overwrite(node) => {
                    let resolved = server_values.resolve_node(node, &existing);
                    self.persistence
                        .apply_user_write_to_server_cache(write.path(), &resolved)?;
                }
                UserWrite::Merge(children) => {
                    let resolved = server_values.resolve_merge(children, &existing);
                    self.persistence
                        .apply_user_merge_to_server_cache(write.path(), &resolved)?;
                }
            }
        }

        if !needs_reevaluation {
            return Ok(Vec::new());
        }
        let affected_tree = match write.write() {
            UserWrite::Overwrite(_) => ImmutableTree::leaf(true),
            UserWrite::Merge(children) => children
                .entries()
                .into_iter()
                .fold(ImmutableTree::empty(), |tree, (path, _)| tree.set(&path, true)),
        };
        self.apply_operation_to_sync_points(&Operation::AckUserWrite {
            path: write.path().clone(),
            affected_tree,
            revert,
        })
    }

    /// Drops every pending write and reverts the visible ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn remove_all_user_writes(&mut self) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence.remove_all_user_writes()?;
            let purged = self.pending_write_tree.purge_all_writes();
            if purged.is_empty() {
                return Ok(Vec::new());
            }
            debug!(count = purged.len(), "purged pending writes");
            self.apply_operation_to_sync_points(&Operation::AckUserWrite {
                path: Path::empty(),
                affected_tree: ImmutableTree::leaf(true),
                revert: true,
            })
        })?;
        Ok(events)
    }

    /// Replays the writes logged in the local cache, without logging them
    /// again. Meant for a freshly opened tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn restore_user_writes(&mut self, clock: &dyn Clock) -> SyncResult<RestoredWrites> {
        let writes = self.persistence.load_user_writes()?;
        let mut events = Vec::new();
        let mut next_write_id = WriteId::new(1);
        for write in &writes {
            let server_values = ServerValues::generate(clock);
            let existing = self
                .calc_complete_event_cache(write.path(), &[])
                .unwrap_or_default();
            match write.write() {
                UserWrite::Overwrite(node) => {
                    let resolved = server_values.resolve_node(node, &existing);
                    events.extend(self.apply_user_overwrite(
                        write.path(),
                        node,
                        resolved,
                        write.write_id(),
                        true,
                        false,
                    )?);
                }
                UserWrite::Merge(children) => {
                    let resolved = server_values.resolve_merge(children, &existing);
                    events.extend(self.apply_user_merge(
                        write.path(),
                        children,
                        &resolved,
                        write.write_id(),
                        false,
                    )?);
                }
            }
            next_write_id = next_write_id.max(write.write_id().next());
        }
        debug!(count = writes.len(), "restored pending writes");
        Ok(RestoredWrites {
            writes,
            events,
            next_write_id,
        })
    }

    /// Applies server data for `path` to every view it touches.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn apply_server_overwrite(&mut self, path: &Path, snapshot: Node) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence
                .update_server_cache(&QuerySpec::default_at(path.clone()), &snapshot)?;
            self.apply_operation_to_sync_points(&Operation::Overwrite {
                source: OperationSource::Server,
                path: path.clone(),
                snapshot,
            })
        })?;
        trace!(path = %path, events = events.len(), "applied server overwrite");
        Ok(events)
    }

    /// Applies a server update of several children of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn apply_server_merge(&mut self, path: &Path, children: CompoundWrite) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence.update_server_cache_with_merge(path, &children)?;
            self.apply_operation_to_sync_points(&Operation::Merge {
                source: OperationSource::Server,
                path: path.clone(),
                children,
            })
        })?;
        trace!(path = %path, events = events.len(), "applied server merge");
        Ok(events)
    }

    /// Marks the default listen at `path` as complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn apply_listen_complete(&mut self, path: &Path) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence
                .set_query_complete(&QuerySpec::default_at(path.clone()))?;
            self.apply_operation_to_sync_points(&Operation::ListenComplete {
                source: OperationSource::Server,
                path: path.clone(),
            })
        })?;
        Ok(events)
    }

    /// Applies server data routed to the filtered query with `tag`.
    /// Updates for unknown tags (a listen that was already removed) are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not at or below the tagged query's location.
    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: &Path,
        snapshot: Node,
        tag: Tag,
    ) -> SyncResult<Vec<Event>> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            trace!(tag = %tag, "dropped overwrite for an unknown tag");
            return Ok(Vec::new());
        };
        let relative = Path::relative(query.path(), path);
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            let query_to_overwrite = if relative.is_empty() {
                query.clone()
            } else {
                QuerySpec::default_at(path.clone())
            };
            self.persistence.update_server_cache(&query_to_overwrite, &snapshot)?;
            self.apply_tagged_operation(
                &query,
                &Operation::Overwrite {
                    source: OperationSource::TaggedServer(query.params().clone()),
                    path: relative,
                    snapshot,
                },
            )
        })?;
        Ok(events)
    }

    /// Applies a server merge routed to the filtered query with `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not at or below the tagged query's location.
    pub fn apply_tagged_query_merge(
        &mut self,
        path: &Path,
        children: CompoundWrite,
        tag: Tag,
    ) -> SyncResult<Vec<Event>> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            trace!(tag = %tag, "dropped merge for an unknown tag");
            return Ok(Vec::new());
        };
        let relative = Path::relative(query.path(), path);
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence.update_server_cache_with_merge(path, &children)?;
            self.apply_tagged_operation(
                &query,
                &Operation::Merge {
                    source: OperationSource::TaggedServer(query.params().clone()),
                    path: relative,
                    children,
                },
            )
        })?;
        Ok(events)
    }

    /// Marks the filtered listen with `tag` as complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn apply_tagged_listen_complete(&mut self, tag: Tag) -> SyncResult<Vec<Event>> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            return Ok(Vec::new());
        };
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| {
            self.persistence.set_query_complete(&query)?;
            self.apply_tagged_operation(
                &query,
                &Operation::ListenComplete {
                    source: OperationSource::TaggedServer(query.params().clone()),
                    path: Path::empty(),
                },
            )
        })?;
        Ok(events)
    }

    /// Reports the outcome of a listen started through the
    /// [`ListenProvider`]. A failed listen removes every registration of the
    /// query and returns their cancel events.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn on_listen_complete(
        &mut self,
        query: &QuerySpec,
        tag: Option<Tag>,
        result: Result<(), DatabaseError>,
    ) -> SyncResult<Vec<Event>> {
        match result {
            Ok(()) => match tag {
                Some(tag) => self.apply_tagged_listen_complete(tag),
                None => self.apply_listen_complete(query.path()),
            },
            Err(error) => {
                warn!(query = %query, error = %error, "listen failed");
                self.remove_all_event_registrations(query, &error)
            }
        }
    }

    /// Adds a registration and returns the events that bring it up to date.
    /// Starts a listen if no listen already covers the query.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn add_event_registration(&mut self, registration: Arc<dyn EventRegistration>) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| self.add_event_registration_inner(registration))?;
        Ok(events)
    }

    fn add_event_registration_inner(
        &mut self,
        registration: Arc<dyn EventRegistration>,
    ) -> PersistenceResult<Vec<Event>> {
        let query = registration.query_spec().clone();
        let path = query.path().clone();

        // The shallowest complete cache on the way down wins.
        let mut server_cache = None;
        let mut found_ancestor_default_view = false;
        let mut tree = &self.sync_point_tree;
        let mut remaining = path.clone();
        loop {
            if let Some(sync_point) = tree.value() {
                if server_cache.is_none() {
                    server_cache = sync_point.complete_server_cache(&remaining);
                }
                found_ancestor_default_view |= sync_point.has_complete_view();
            }
            let Some(child) = remaining.front().and_then(|front| tree.child(front)) else {
                break;
            };
            tree = child;
            remaining = remaining.pop_front();
        }

        if self.sync_point_tree.get(&path).is_none() {
            self.sync_point_tree = self.sync_point_tree.set(&path, SyncPoint::new());
        }
        self.persistence.set_query_active(&query)?;

        let server_cache = match server_cache {
            Some(node) => CacheNode::new(IndexedNode::new(node, query.index().clone()), true, false),
            None => self.cached_server_data(&query)?,
        };

        let view_exists = self
            .sync_point_tree
            .get(&path)
            .is_some_and(|sync_point| sync_point.view_exists_for_query(&query));
        if !view_exists && !query.loads_all_data() {
            assert!(
                !self.query_to_tag.contains_key(&query),
                "a tag exists for a query without a view"
            );
            let tag = Tag::new(self.next_query_tag);
            self.next_query_tag += 1;
            self.query_to_tag.insert(query.clone(), tag);
            self.tag_to_query.insert(tag, query.clone());
        }

        let writes = self.pending_write_tree.child_writes(&path);
        let Some(sync_point) = self.sync_point_tree.get_mut(&path) else {
            unreachable!("the sync point was just created");
        };
        let events = sync_point.add_event_registration(registration, &writes, &server_cache, &*self.persistence)?;

        if !view_exists && !found_ancestor_default_view {
            self.setup_listener(&query);
        }
        Ok(events.into_iter().map(Event::Data).collect())
    }

    /// Server data for `query` from the local cache, completed with whatever
    /// the views below its location know.
    fn cached_server_data(&self, query: &QuerySpec) -> PersistenceResult<CacheNode> {
        let persisted = self.persistence.server_cache(query)?;
        if persisted.is_fully_initialized() {
            return Ok(persisted);
        }
        let mut node = persisted.node().clone();
        if let Some(subtree) = self.sync_point_tree.descendant(query.path()) {
            for (key, child) in subtree.children() {
                if let Some(complete) = child
                    .value()
                    .and_then(|sync_point| sync_point.complete_server_cache(&Path::empty()))
                {
                    node = node.update_immediate_child(key, complete);
                }
            }
        }
        Ok(CacheNode::new(
            IndexedNode::new(node, query.index().clone()),
            false,
            persisted.is_filtered(),
        ))
    }

    /// Removes one registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn remove_event_registration(&mut self, registration: &dyn EventRegistration) -> SyncResult<Vec<Event>> {
        let query = registration.query_spec().clone();
        let persistence = Arc::clone(&self.persistence);
        let events = persistence
            .in_transaction(|| self.remove_event_registration_inner(&query, Some(registration), None))?;
        Ok(events)
    }

    /// Removes every registration of `query` (of every query at its
    /// location for a default query) and returns their cancel events.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn remove_all_event_registrations(
        &mut self,
        query: &QuerySpec,
        error: &DatabaseError,
    ) -> SyncResult<Vec<Event>> {
        let persistence = Arc::clone(&self.persistence);
        let events = persistence.in_transaction(|| self.remove_event_registration_inner(query, None, Some(error)))?;
        Ok(events)
    }

    fn remove_event_registration_inner(
        &mut self,
        query: &QuerySpec,
        registration: Option<&dyn EventRegistration>,
        cancel_error: Option<&DatabaseError>,
    ) -> PersistenceResult<Vec<Event>> {
        let path = query.path();
        let Some(sync_point) = self.sync_point_tree.get_mut(path) else {
            return Ok(Vec::new());
        };
        if !query.is_default() && !sync_point.view_exists_for_query(query) {
            return Ok(Vec::new());
        }
        let (removed, cancel_events) = sync_point.remove_event_registration(query, registration, cancel_error);
        if sync_point.is_empty() {
            self.sync_point_tree = self.sync_point_tree.remove(path);
        }

        let mut removing_default = false;
        for removed_query in &removed {
            self.persistence.set_query_inactive(removed_query)?;
            removing_default |= removed_query.loads_all_data();
        }

        let covered = self
            .sync_point_tree
            .root_most_value_matching(path, SyncPoint::has_complete_view)
            .is_some();

        if removing_default && !covered {
            // Listens shadowed by the removed default listen resume.
            if let Some(subtree) = self.sync_point_tree.descendant(path) {
                for view in collect_distinct_views(subtree) {
                    self.start_listening_for_view(view);
                }
            }
        }

        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                self.stop_listening(&query_for_listening(query), None);
            } else {
                for removed_query in &removed {
                    let tag = self.query_to_tag.get(removed_query).copied();
                    assert!(tag.is_some(), "a filtered query was removed without a tag");
                    self.stop_listening(&query_for_listening(removed_query), tag);
                }
            }
        }

        for removed_query in removed.iter().filter(|q| !q.loads_all_data()) {
            let Some(tag) = self.query_to_tag.remove(removed_query) else {
                panic!("a filtered query was removed without a tag");
            };
            self.tag_to_query.remove(&tag);
        }
        Ok(cancel_events)
    }

    /// Keeps `query` listened to, whether or not anything is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn keep_synced(&mut self, query: &QuerySpec, keep: bool) -> SyncResult<()> {
        if keep && !self.keep_synced_queries.contains(query) {
            self.add_event_registration(Arc::new(KeepSyncedRegistration::new(query.clone())))?;
            self.keep_synced_queries.insert(query.clone());
        } else if !keep && self.keep_synced_queries.contains(query) {
            self.remove_event_registration(&KeepSyncedRegistration::new(query.clone()))?;
            self.keep_synced_queries.remove(query);
        }
        Ok(())
    }

    /// The value at `path` as listeners would see it, ignoring the pending
    /// writes in `write_ids_to_exclude`. `None` if too little is known.
    pub fn calc_complete_event_cache(&self, path: &Path, write_ids_to_exclude: &[WriteId]) -> Option<Node> {
        let mut server_cache = None;
        let mut tree = &self.sync_point_tree;
        let mut remaining = path.clone();
        loop {
            if let Some(found) = tree
                .value()
                .and_then(|sync_point| sync_point.complete_server_cache(&remaining))
            {
                server_cache = Some(found);
            }
            let Some(child) = remaining.front().and_then(|front| tree.child(front)) else {
                break;
            };
            tree = child;
            remaining = remaining.pop_front();
        }
        self.pending_write_tree
            .calc_complete_event_cache(path, server_cache.as_ref(), write_ids_to_exclude, true)
    }

    /// The best-known value for a one-shot read of `query`, with pending
    /// writes applied. `None` if nothing complete is known locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cache fails.
    pub fn server_value(&self, query: &QuerySpec) -> SyncResult<Option<Node>> {
        let path = query.path();
        let server_cache = match self.calc_server_cache_along(path) {
            Some(node) => CacheNode::new(IndexedNode::new(node, query.index().clone()), true, false),
            None => self.cached_server_data(query)?,
        };
        let writes = self.pending_write_tree.child_writes(path);
        let view = match self.sync_point_tree.get(path).and_then(|sp| sp.view_for_query(query)) {
            Some(view) => view.clone(),
            None => build_view(query, &writes, &server_cache),
        };
        Ok(view.complete_node().cloned())
    }

    fn calc_server_cache_along(&self, path: &Path) -> Option<Node> {
        let mut tree = &self.sync_point_tree;
        let mut remaining = path.clone();
        loop {
            if let Some(found) = tree
                .value()
                .and_then(|sync_point| sync_point.complete_server_cache(&remaining))
            {
                return Some(found);
            }
            let child = remaining.front().and_then(|front| tree.child(front))?;
            tree = child;
            remaining = remaining.pop_front();
        }
    }

    fn apply_operation_to_sync_points(&mut self, operation: &Operation) -> PersistenceResult<Vec<Event>> {
        let writes = self.pending_write_tree.child_writes(&Path::empty());
        let events = apply_operation_helper(operation, &mut self.sync_point_tree, None, &writes, &*self.persistence)?;
        Ok(events.into_iter().map(Event::Data).collect())
    }

    fn apply_tagged_operation(&mut self, query: &QuerySpec, operation: &Operation) -> PersistenceResult<Vec<Event>> {
        let writes = self.pending_write_tree.child_writes(query.path());
        let Some(sync_point) = self.sync_point_tree.get_mut(query.path()) else {
            panic!("missing sync point for tagged query {query}");
        };
        // Tagged operations never reach past their own query.
        let events = sync_point.apply_operation(operation, &writes, None, &*self.persistence)?;
        Ok(events.into_iter().map(Event::Data).collect())
    }

    fn setup_listener(&self, query: &QuerySpec) {
        let tag = self.query_to_tag.get(query).copied();
        let Some(subtree) = self.sync_point_tree.descendant(query.path()) else {
            return;
        };
        if let Some(view) = subtree.value().and_then(|sync_point| sync_point.view_for_query(query)) {
            self.start_listening_for_view(view);
        }

        if tag.is_some() {
            assert!(
                !subtree.value().is_some_and(SyncPoint::has_complete_view),
                "a filtered listen was started under a default listen"
            );
            return;
        }
        // A default listen shadows every listen below it.
        let shadowed = subtree.fold(Vec::new(), |relative, sync_point, mut shadowed| {
            if !relative.is_empty() && sync_point.has_complete_view() {
                shadowed.extend(sync_point.complete_view().map(|view| view.query().clone()));
            } else {
                shadowed.extend(sync_point.query_views().map(|view| view.query().clone()));
            }
            shadowed
        });
        for shadowed_query in shadowed {
            let tag = self.query_to_tag.get(&shadowed_query).copied();
            self.stop_listening(&query_for_listening(&shadowed_query), tag);
        }
    }

    fn start_listening_for_view(&self, view: &View) {
        let query = view.query();
        let tag = self.query_to_tag.get(query).copied();
        let hash = view
            .server_cache()
            .map_or_else(|| Node::empty().content_hash(), Node::content_hash);
        let listened = query_for_listening(query);
        debug!(query = %listened, tag = ?tag, "start listening");
        self.listen_provider.start_listening(&listened, tag, &hash);
    }

    fn stop_listening(&self, query: &QuerySpec, tag: Option<Tag>) {
        debug!(query = %query, tag = ?tag, "stop listening");
        self.listen_provider.stop_listening(query, tag);
    }
}

/// A query that loads all data is listened to as the default query.
fn query_for_listening(query: &QuerySpec) -> QuerySpec {
    if query.loads_all_data() && !query.is_default() {
        QuerySpec::default_at(query.path().clone())
    } else {
        query.clone()
    }
}

/// The views whose listens cover `tree`: a complete view stops the search
/// below it.
fn collect_distinct_views(tree: &ImmutableTree<SyncPoint>) -> Vec<&View> {
    if let Some(view) = tree.value().and_then(SyncPoint::complete_view) {
        return vec![view];
    }
    let mut views: Vec<&View> = tree
        .value()
        .map(|sync_point| sync_point.query_views().collect())
        .unwrap_or_default();
    for (_, child) in tree.children() {
        views.extend(collect_distinct_views(child));
    }
    views
}

fn apply_operation_helper(
    operation: &Operation,
    tree: &mut ImmutableTree<SyncPoint>,
    server_cache: Option<Node>,
    writes: &WriteTreeRef<'_>,
    persistence: &dyn PersistenceManager,
) -> PersistenceResult<Vec<DataEvent>> {
    let Some(front) = operation.path().front().cloned() else {
        return apply_operation_descendants_helper(operation, tree, server_cache, writes, persistence);
    };
    let server_cache = server_cache.or_else(|| {
        tree.value()
            .and_then(|sync_point| sync_point.complete_server_cache(&Path::empty()))
    });

    let mut events = Vec::new();
    if let Some(child_operation) = operation.operation_for_child(&front) {
        if let Some(child_tree) = tree.child_mut(&front) {
            let child_server_cache = server_cache.as_ref().map(|node| node.immediate_child(&front));
            events.extend(apply_operation_helper(
                &child_operation,
                child_tree,
                child_server_cache,
                &writes.child(&front),
                persistence,
            )?);
        }
    }
    if let Some(sync_point) = tree.value_mut() {
        events.extend(sync_point.apply_operation(operation, writes, server_cache.as_ref(), persistence)?);
    }
    Ok(events)
}

fn apply_operation_descendants_helper(
    operation: &Operation,
    tree: &mut ImmutableTree<SyncPoint>,
    server_cache: Option<Node>,
    writes: &WriteTreeRef<'_>,
    persistence: &dyn PersistenceManager,
) -> PersistenceResult<Vec<DataEvent>> {
    let server_cache = server_cache.or_else(|| {
        tree.value()
            .and_then(|sync_point| sync_point.complete_server_cache(&Path::empty()))
    });

    let mut events = Vec::new();
    for (key, child_tree) in tree.children_mut() {
        let Some(child_operation) = operation.operation_for_child(key) else {
            continue;
        };
        let child_server_cache = server_cache.as_ref().map(|node| node.immediate_child(key));
        events.extend(apply_operation_descendants_helper(
            &child_operation,
            child_tree,
            child_server_cache,
            &writes.child(key),
            persistence,
        )?);
    }
    if let Some(sync_point) = tree.value_mut() {
        events.extend(sync_point.apply_operation(operation, writes, server_cache.as_ref(), persistence)?);
    }
    Ok(events)
}
