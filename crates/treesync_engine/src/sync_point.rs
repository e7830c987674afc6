//! All views at one location.

use std::collections::BTreeSet;
use std::sync::Arc;

use treesync_core::{CacheNode, ChildKey, IndexedNode, Node, Path, QuerySpec};
use treesync_persistence::{PersistenceManager, PersistenceResult};

use crate::error::DatabaseError;
use crate::event::{DataEvent, Event, EventRegistration};
use crate::operation::Operation;
use crate::view::{tracked_key_changes, View, ViewCache};
use crate::write_tree::WriteTreeRef;

/// The views of every query listened to at one location.
///
/// At most one view loads all data; it is the location's complete view.
/// Views keep the order in which they were created.
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncPoint {
    views: Vec<View>,
}

impl SyncPoint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Applies `operation` to the addressed view (tagged operations) or to
    /// every view.
    ///
    /// # Panics
    ///
    /// Panics if a tagged operation addresses a view that does not exist.
    pub(crate) fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_server_cache: Option<&Node>,
        persistence: &dyn PersistenceManager,
    ) -> PersistenceResult<Vec<DataEvent>> {
        match operation.source().query_params() {
            Some(params) => {
                let Some(view) = self.views.iter_mut().find(|view| view.query().params() == params) else {
                    panic!("tagged operation for a query without a view");
                };
                apply_operation_to_view(view, operation, writes, complete_server_cache, persistence)
            }
            None => {
                let mut events = Vec::new();
                for view in &mut self.views {
                    events.extend(apply_operation_to_view(
                        view,
                        operation,
                        writes,
                        complete_server_cache,
                        persistence,
                    )?);
                }
                Ok(events)
            }
        }
    }

    /// Adds a registration, creating its view if needed, and returns the
    /// registration's initial events.
    pub(crate) fn add_event_registration(
        &mut self,
        registration: Arc<dyn EventRegistration>,
        writes: &WriteTreeRef<'_>,
        server_cache: &CacheNode,
        persistence: &dyn PersistenceManager,
    ) -> PersistenceResult<Vec<DataEvent>> {
        let query = registration.query_spec().clone();
        if !self.views.iter().any(|view| view.query().params() == query.params()) {
            self.views.push(build_view(&query, writes, server_cache));
        }
        let Some(view) = self
            .views
            .iter_mut()
            .find(|view| view.query().params() == query.params())
        else {
            unreachable!("the view was just created");
        };
        if !query.loads_all_data() {
            // Persistence needs to know which children the filtered view holds.
            let keys: BTreeSet<ChildKey> = view.event_cache_keys().collect();
            persistence.set_tracked_query_keys(&query, &keys)?;
        }
        view.add_event_registration(Arc::clone(&registration));
        Ok(view.initial_events(&registration))
    }

    /// Removes a registration (all of them if `None`).
    ///
    /// A default query removes the registration from every view here.
    /// Returns the queries whose views went away, plus the default query
    /// when the last complete view was removed, and any cancel events.
    pub(crate) fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: Option<&dyn EventRegistration>,
        cancel_error: Option<&DatabaseError>,
    ) -> (Vec<QuerySpec>, Vec<Event>) {
        let mut removed = Vec::new();
        let mut cancel_events = Vec::new();
        let had_complete_view = self.has_complete_view();
        let all_views = query.is_default();

        let mut position = 0;
        while position < self.views.len() {
            let view = &mut self.views[position];
            if !all_views && view.query().params() != query.params() {
                position += 1;
                continue;
            }
            cancel_events.extend(view.remove_event_registration(registration, cancel_error));
            if view.is_empty() {
                let view = self.views.remove(position);
                if !view.query().loads_all_data() {
                    removed.push(view.query().clone());
                }
            } else {
                position += 1;
            }
        }

        if had_complete_view && !self.has_complete_view() {
            removed.push(QuerySpec::default_at(query.path().clone()));
        }
        (removed, cancel_events)
    }

    /// Views of filtered queries.
    pub(crate) fn query_views(&self) -> impl Iterator<Item = &View> {
        self.views.iter().filter(|view| !view.query().loads_all_data())
    }

    /// The complete server value at `path` below this location, if any
    /// view knows it.
    pub(crate) fn complete_server_cache(&self, path: &Path) -> Option<Node> {
        self.views.iter().find_map(|view| view.complete_server_cache(path))
    }

    /// The view answering `query`. Any view that loads all data answers a
    /// query that loads all data.
    pub(crate) fn view_for_query(&self, query: &QuerySpec) -> Option<&View> {
        if query.loads_all_data() {
            self.complete_view()
        } else {
            self.views.iter().find(|view| view.query().params() == query.params())
        }
    }

    pub(crate) fn view_exists_for_query(&self, query: &QuerySpec) -> bool {
        self.view_for_query(query).is_some()
    }

    pub(crate) fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    pub(crate) fn complete_view(&self) -> Option<&View> {
        self.views.iter().find(|view| view.query().loads_all_data())
    }
}

/// A view for `query` over the given caches, without registrations.
pub(crate) fn build_view(query: &QuerySpec, writes: &WriteTreeRef<'_>, server_cache: &CacheNode) -> View {
    let complete_server = server_cache
        .is_fully_initialized()
        .then(|| server_cache.node());
    let (event_cache, complete) = match writes.calc_complete_event_cache(complete_server) {
        Some(node) => (node, true),
        None => (writes.calc_complete_event_children(server_cache.node()), false),
    };
    let view_cache = ViewCache::new(
        CacheNode::new(IndexedNode::new(event_cache, query.index().clone()), complete, false),
        server_cache.clone(),
    );
    View::new(query.clone(), &view_cache)
}

fn apply_operation_to_view(
    view: &mut View,
    operation: &Operation,
    writes: &WriteTreeRef<'_>,
    complete_server_cache: Option<&Node>,
    persistence: &dyn PersistenceManager,
) -> PersistenceResult<Vec<DataEvent>> {
    let result = view.apply_operation(operation, writes, complete_server_cache);
    if !view.query().loads_all_data() {
        let (added, removed) = tracked_key_changes(&result.changes);
        if !added.is_empty() || !removed.is_empty() {
            persistence.update_tracked_query_keys(
                view.query(),
                &added.into_iter().collect(),
                &removed.into_iter().collect(),
            )?;
        }
    }
    Ok(result.events)
}
