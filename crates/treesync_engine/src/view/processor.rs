//! Applies operations to a view's caches.

use treesync_core::{ChildKey, CompoundWrite, ImmutableTree, IndexedNode, Node, Path};

use super::accumulator::ChildChangeAccumulator;
use super::cache::ViewCache;
use super::change::Change;
use super::child_source::{CompleteChildSource, NoCompleteChildSource, WriteTreeCompleteChildSource};
use super::filter::NodeFilter;
use crate::operation::Operation;
use crate::write_tree::WriteTreeRef;

/// The caches after an operation, and the changes it made.
#[derive(Debug)]
pub(crate) struct ProcessorResult {
    pub(crate) view_cache: ViewCache,
    pub(crate) changes: Vec<Change>,
}

/// Turns operations into new view caches for one query.
#[derive(Debug, Clone)]
pub(crate) struct ViewProcessor {
    filter: NodeFilter,
}

impl ViewProcessor {
    pub(crate) fn new(filter: NodeFilter) -> Self {
        Self { filter }
    }

    pub(crate) fn filter(&self) -> &NodeFilter {
        &self.filter
    }

    /// Applies `operation` to `old`.
    ///
    /// `complete_cache` is a complete server value for the view's location
    /// taken from an ancestor or descendant, if one exists.
    ///
    /// # Panics
    ///
    /// Panics if a complete server cache would become incomplete.
    pub(crate) fn apply_operation(
        &self,
        old: &ViewCache,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
    ) -> ProcessorResult {
        let mut accumulator = ChildChangeAccumulator::new();
        let view_cache = match operation {
            Operation::Overwrite {
                source,
                path,
                snapshot,
            } => {
                if source.is_from_user() {
                    self.apply_user_overwrite(old, path, snapshot.clone(), writes, complete_cache, &mut accumulator)
                } else {
                    let filter_server_node =
                        source.is_tagged() || (old.server_cache().is_filtered() && !path.is_empty());
                    self.apply_server_overwrite(
                        old,
                        path,
                        snapshot,
                        writes,
                        complete_cache,
                        filter_server_node,
                        &mut accumulator,
                    )
                }
            }
            Operation::Merge {
                source,
                path,
                children,
            } => {
                if source.is_from_user() {
                    self.apply_user_merge(old, path, children, writes, complete_cache, &mut accumulator)
                } else {
                    let filter_server_node = source.is_tagged() || old.server_cache().is_filtered();
                    self.apply_server_merge(
                        old,
                        path,
                        children,
                        writes,
                        complete_cache,
                        filter_server_node,
                        &mut accumulator,
                    )
                }
            }
            Operation::AckUserWrite {
                path,
                affected_tree,
                revert,
            } => {
                if *revert {
                    self.revert_user_write(old, path, writes, complete_cache, &mut accumulator)
                } else {
                    self.ack_user_write(old, path, affected_tree, writes, complete_cache, &mut accumulator)
                }
            }
            Operation::ListenComplete { path, .. } => self.listen_complete(old, path, writes, &mut accumulator),
        };
        assert!(
            view_cache.server_cache().is_fully_initialized() || !old.server_cache().is_fully_initialized(),
            "once a server snap is complete, it should never go back"
        );
        let mut changes = accumulator.into_changes();
        maybe_add_value_event(old, &view_cache, &mut changes);
        ProcessorResult { view_cache, changes }
    }

    fn server_filter(&self, filter_server_node: bool) -> NodeFilter {
        if filter_server_node {
            self.filter.clone()
        } else {
            self.filter.indexed_filter()
        }
    }

    /// Recomputes the event cache at `change_path` after the server cache
    /// changed there.
    fn generate_event_cache_after_server_event(
        &self,
        view_cache: &ViewCache,
        change_path: &Path,
        writes: &WriteTreeRef<'_>,
        source: &dyn CompleteChildSource,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(change_path).is_some() {
            return view_cache.clone();
        }
        let old_event_snap = view_cache.event_cache();
        let new_event_cache = match change_path.front() {
            None => {
                assert!(
                    view_cache.server_cache().is_fully_initialized(),
                    "a change at the view root needs complete server data"
                );
                let server = view_cache.server_cache().node();
                let with_local_writes = if view_cache.server_cache().is_filtered() {
                    // Deep writes onto a filtered cache may land on incomplete
                    // children, so only complete children are layered.
                    let complete_children = if server.is_leaf() { Node::empty() } else { server.clone() };
                    writes.calc_complete_event_children(&complete_children)
                } else {
                    writes
                        .calc_complete_event_cache(Some(server))
                        .unwrap_or_default()
                };
                let indexed = IndexedNode::new(with_local_writes, self.filter.index().clone());
                self.filter
                    .update_full_node(old_event_snap.indexed_node(), &indexed, Some(accumulator))
            }
            Some(key) if key.is_priority() => {
                assert!(
                    change_path.len() == 1,
                    "a priority path cannot have additional components"
                );
                let server = view_cache.server_cache().node();
                match writes.calc_event_cache_after_server_overwrite(change_path, server) {
                    Some(priority) => self.filter.update_priority(old_event_snap.indexed_node(), &priority),
                    None => old_event_snap.indexed_node().clone(),
                }
            }
            Some(key) => {
                let child_change_path = change_path.pop_front();
                let new_event_child = if old_event_snap.is_complete_for_child(key) {
                    let server = view_cache.server_cache().node();
                    let old_child = old_event_snap.node().immediate_child(key);
                    match writes.calc_event_cache_after_server_overwrite(change_path, server) {
                        Some(update) => Some(old_child.update_child(&child_change_path, update)),
                        None => Some(old_child),
                    }
                } else {
                    writes.calc_complete_child(key, view_cache.server_cache())
                };
                match new_event_child {
                    Some(child) => self.filter.update_child(
                        old_event_snap.indexed_node(),
                        key,
                        child,
                        &child_change_path,
                        source,
                        Some(accumulator),
                    ),
                    None => old_event_snap.indexed_node().clone(),
                }
            }
        };
        view_cache.update_event_snap(
            new_event_cache,
            old_event_snap.is_fully_initialized() || change_path.is_empty(),
            self.filter.filters_nodes(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_overwrite(
        &self,
        old: &ViewCache,
        change_path: &Path,
        changed_snap: &Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        filter_server_node: bool,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_snap = old.server_cache();
        let server_filter = self.server_filter(filter_server_node);
        let new_server_cache = match change_path.front() {
            None => server_filter.update_full_node(
                old_server_snap.indexed_node(),
                &IndexedNode::new(changed_snap.clone(), server_filter.index().clone()),
                None,
            ),
            Some(key) if server_filter.filters_nodes() && !old_server_snap.is_filtered() => {
                // The cache was never filtered, so filter the whole node now.
                let new_child = old_server_snap
                    .node()
                    .immediate_child(key)
                    .update_child(&change_path.pop_front(), changed_snap.clone());
                let new_server_node = old_server_snap.indexed_node().update_child(key, new_child);
                server_filter.update_full_node(old_server_snap.indexed_node(), &new_server_node, None)
            }
            Some(key) => {
                if !old_server_snap.is_complete_for_path(change_path) && change_path.len() > 1 {
                    // Deep updates to incomplete children belong to other listeners.
                    return old.clone();
                }
                let child_change_path = change_path.pop_front();
                let new_child = old_server_snap
                    .node()
                    .immediate_child(key)
                    .update_child(&child_change_path, changed_snap.clone());
                if key.is_priority() {
                    server_filter.update_priority(old_server_snap.indexed_node(), &new_child)
                } else {
                    server_filter.update_child(
                        old_server_snap.indexed_node(),
                        key,
                        new_child,
                        &child_change_path,
                        &NoCompleteChildSource,
                        None,
                    )
                }
            }
        };
        let new_view_cache = old.update_server_snap(
            new_server_cache,
            old_server_snap.is_fully_initialized() || change_path.is_empty(),
            server_filter.filters_nodes(),
        );
        let source = WriteTreeCompleteChildSource::new(writes.clone(), &new_view_cache, complete_cache);
        self.generate_event_cache_after_server_event(&new_view_cache, change_path, writes, &source, accumulator)
    }

    fn apply_user_overwrite(
        &self,
        old: &ViewCache,
        change_path: &Path,
        changed_snap: Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_event_snap = old.event_cache();
        let source = WriteTreeCompleteChildSource::new(writes.clone(), old, complete_cache);
        match change_path.front() {
            None => {
                let indexed = IndexedNode::new(changed_snap, self.filter.index().clone());
                let new_event_cache =
                    self.filter
                        .update_full_node(old_event_snap.indexed_node(), &indexed, Some(accumulator));
                old.update_event_snap(new_event_cache, true, self.filter.filters_nodes())
            }
            Some(key) if key.is_priority() => {
                let new_event_cache = self
                    .filter
                    .update_priority(old_event_snap.indexed_node(), &changed_snap);
                old.update_event_snap(
                    new_event_cache,
                    old_event_snap.is_fully_initialized(),
                    old_event_snap.is_filtered(),
                )
            }
            Some(key) => {
                let child_change_path = change_path.pop_front();
                let old_child = old_event_snap.node().immediate_child(key);
                let new_child = match child_change_path.parent() {
                    None => changed_snap,
                    Some(parent) => match source.complete_child(key) {
                        // The server sends priorities with the data, so a
                        // priority on a missing node waits for it.
                        Some(child)
                            if child_change_path.back().is_some_and(ChildKey::is_priority)
                                && child.child(&parent).is_empty() =>
                        {
                            child
                        }
                        Some(child) => child.update_child(&child_change_path, changed_snap),
                        None => Node::empty(),
                    },
                };
                if old_child == new_child {
                    return old.clone();
                }
                let new_event_snap = self.filter.update_child(
                    old_event_snap.indexed_node(),
                    key,
                    new_child,
                    &child_change_path,
                    &source,
                    Some(accumulator),
                );
                old.update_event_snap(
                    new_event_snap,
                    old_event_snap.is_fully_initialized(),
                    self.filter.filters_nodes(),
                )
            }
        }
    }

    fn apply_user_merge(
        &self,
        old: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        assert!(
            changed_children.root_write().is_none(),
            "a merge cannot replace its whole location"
        );
        let entries = changed_children.entries();
        let cache_has_child = |write_path: &Path| {
            write_path
                .front()
                .is_some_and(|key| old.event_cache().is_complete_for_child(key))
        };
        // Children already in view go first, so a limited window makes room
        // before new children are considered.
        let mut current = old.clone();
        for known in [true, false] {
            for (relative, node) in &entries {
                let write_path = path.join(relative);
                if cache_has_child(&write_path) == known {
                    current = self.apply_user_overwrite(
                        &current,
                        &write_path,
                        node.clone(),
                        writes,
                        complete_cache,
                        accumulator,
                    );
                }
            }
        }
        current
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_merge(
        &self,
        old: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        filter_server_node: bool,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let server_cache = old.server_cache();
        if server_cache.node().is_empty() && !server_cache.is_fully_initialized() {
            // Meant for an earlier listen here; complete data follows.
            return old.clone();
        }
        let actual_merge = if path.is_empty() {
            changed_children.clone()
        } else {
            CompoundWrite::empty().add_writes(path, changed_children)
        };
        let server_node = server_cache.node();
        let child_merges = actual_merge.child_compound_writes();
        let mut current = old.clone();
        for (key, child_merge) in &child_merges {
            if server_node.has_child(key) {
                let new_child = child_merge.apply(&server_node.immediate_child(key));
                current = self.apply_server_overwrite(
                    &current,
                    &Path::from_key(key.clone()),
                    &new_child,
                    writes,
                    complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
        }
        for (key, child_merge) in &child_merges {
            let unknown_deep_merge =
                !server_cache.is_complete_for_child(key) && child_merge.root_write().is_none();
            if !server_node.has_child(key) && !unknown_deep_merge {
                let new_child = child_merge.apply(&server_node.immediate_child(key));
                current = self.apply_server_overwrite(
                    &current,
                    &Path::from_key(key.clone()),
                    &new_child,
                    writes,
                    complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
        }
        current
    }

    /// Re-applies the server cache at the acknowledged locations, now that
    /// the write no longer shadows it.
    fn ack_user_write(
        &self,
        view_cache: &ViewCache,
        ack_path: &Path,
        affected_tree: &ImmutableTree<bool>,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(ack_path).is_some() {
            return view_cache.clone();
        }
        let filter_server_node = view_cache.server_cache().is_filtered();
        let server_cache = view_cache.server_cache();
        if affected_tree.value().is_some() {
            if (ack_path.is_empty() && server_cache.is_fully_initialized())
                || server_cache.is_complete_for_path(ack_path)
            {
                self.apply_server_overwrite(
                    view_cache,
                    ack_path,
                    &server_cache.node().child(ack_path),
                    writes,
                    complete_cache,
                    filter_server_node,
                    accumulator,
                )
            } else if ack_path.is_empty() {
                // Acked at this location without full data: replay what we have.
                let changed_children = CompoundWrite::from_child_merge(
                    server_cache
                        .node()
                        .children()
                        .map(|(key, child)| (key.clone(), child.clone())),
                );
                self.apply_server_merge(
                    view_cache,
                    ack_path,
                    &changed_children,
                    writes,
                    complete_cache,
                    filter_server_node,
                    accumulator,
                )
            } else {
                view_cache.clone()
            }
        } else {
            let mut changed_children = CompoundWrite::empty();
            for (merge_path, _) in affected_tree.entries() {
                let server_cache_path = ack_path.join(&merge_path);
                if server_cache.is_complete_for_path(&server_cache_path) {
                    changed_children =
                        changed_children.add_write(&merge_path, server_cache.node().child(&server_cache_path));
                }
            }
            self.apply_server_merge(
                view_cache,
                ack_path,
                &changed_children,
                writes,
                complete_cache,
                filter_server_node,
                accumulator,
            )
        }
    }

    /// Rebuilds the event cache at `path` without the reverted write.
    fn revert_user_write(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(path).is_some() {
            return view_cache.clone();
        }
        let source = WriteTreeCompleteChildSource::new(writes.clone(), view_cache, complete_cache);
        let old_event_cache = view_cache.event_cache().indexed_node();
        let server_cache = view_cache.server_cache();
        let new_event_cache = match path.front() {
            Some(key) if !key.is_priority() => {
                let new_child = writes.calc_complete_child(key, server_cache).or_else(|| {
                    server_cache
                        .is_complete_for_child(key)
                        .then(|| old_event_cache.node().immediate_child(key))
                });
                let mut new_event_cache = match new_child {
                    Some(child) => self.filter.update_child(
                        old_event_cache,
                        key,
                        child,
                        &path.pop_front(),
                        &source,
                        Some(&mut *accumulator),
                    ),
                    None if view_cache.event_cache().node().has_child(key) => self.filter.update_child(
                        old_event_cache,
                        key,
                        Node::empty(),
                        &path.pop_front(),
                        &source,
                        Some(&mut *accumulator),
                    ),
                    None => old_event_cache.clone(),
                };
                if new_event_cache.node().is_empty() && server_cache.is_fully_initialized() {
                    // Reverting every child write may leave a leaf behind.
                    let complete = writes
                        .calc_complete_event_cache(Some(server_cache.node()))
                        .unwrap_or_default();
                    if complete.is_leaf() {
                        let indexed = IndexedNode::new(complete, self.filter.index().clone());
                        new_event_cache =
                            self.filter
                                .update_full_node(&new_event_cache, &indexed, Some(accumulator));
                    }
                }
                new_event_cache
            }
            _ => {
                let new_node = if server_cache.is_fully_initialized() {
                    writes
                        .calc_complete_event_cache(Some(server_cache.node()))
                        .unwrap_or_default()
                } else {
                    writes.calc_complete_event_children(server_cache.node())
                };
                let indexed = IndexedNode::new(new_node, self.filter.index().clone());
                self.filter
                    .update_full_node(old_event_cache, &indexed, Some(accumulator))
            }
        };
        let complete =
            server_cache.is_fully_initialized() || writes.shadowing_write(&Path::empty()).is_some();
        view_cache.update_event_snap(new_event_cache, complete, self.filter.filters_nodes())
    }

    fn listen_complete(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server = view_cache.server_cache();
        let new_view_cache = view_cache.update_server_snap(
            old_server.indexed_node().clone(),
            old_server.is_fully_initialized() || path.is_empty(),
            old_server.is_filtered(),
        );
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            path,
            writes,
            &NoCompleteChildSource,
            accumulator,
        )
    }
}

/// Adds a value change when the event cache became complete or its value
/// changed.
fn maybe_add_value_event(old: &ViewCache, new: &ViewCache, changes: &mut Vec<Change>) {
    let event_snap = new.event_cache();
    if !event_snap.is_fully_initialized() {
        return;
    }
    let node = event_snap.node();
    let raise = match old.complete_event_snap() {
        None => true,
        Some(old_node) => {
            !changes.is_empty()
                || ((node.is_leaf() || node.is_empty()) && node != old_node)
                || node.priority() != old_node.priority()
        }
    };
    if raise {
        changes.push(Change::value(event_snap.indexed_node().clone()));
    }
}
