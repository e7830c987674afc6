//! Views: the cached, filtered data of one query at one location, plus the
//! registrations listening to it.

mod accumulator;
mod cache;
mod change;
mod child_source;
mod event_generator;
mod filter;
mod processor;

use std::sync::Arc;

use treesync_core::{CacheNode, ChildKey, IndexedNode, Node, Path, QuerySpec};

pub(crate) use cache::ViewCache;
pub(crate) use change::Change;

use self::event_generator::EventGenerator;
use self::filter::NodeFilter;
use self::processor::ViewProcessor;
use crate::error::DatabaseError;
use crate::event::{CancelEvent, DataEvent, Event, EventRegistration, EventType};
use crate::operation::Operation;
use crate::write_tree::WriteTreeRef;

/// What applying an operation to a view produced.
#[derive(Debug)]
pub(crate) struct ViewOperationResult {
    pub(crate) events: Vec<DataEvent>,
    pub(crate) changes: Vec<Change>,
}

#[derive(Debug, Clone)]
pub(crate) struct View {
    query: QuerySpec,
    processor: ViewProcessor,
    view_cache: ViewCache,
    registrations: Vec<Arc<dyn EventRegistration>>,
    event_generator: EventGenerator,
}

impl View {
    /// Creates a view from initial caches, filtering them for the query.
    ///
    /// The server cache is only ordered here; it gets filtered once a
    /// tagged listen delivers data for this query.
    pub(crate) fn new(query: QuerySpec, initial: &ViewCache) -> Self {
        let index = query.index().clone();
        let filter = NodeFilter::for_params(query.params());
        let index_filter = filter.indexed_filter();
        let empty = IndexedNode::new(Node::empty(), index.clone());

        let initial_server = initial.server_cache();
        let initial_event = initial.event_cache();
        let server_snap = index_filter.update_full_node(
            &empty,
            &IndexedNode::new(initial_server.node().clone(), index.clone()),
            None,
        );
        let event_snap = filter.update_full_node(
            &empty,
            &IndexedNode::new(initial_event.node().clone(), index),
            None,
        );
        let view_cache = ViewCache::new(
            CacheNode::new(event_snap, initial_event.is_fully_initialized(), filter.filters_nodes()),
            CacheNode::new(
                server_snap,
                initial_server.is_fully_initialized(),
                index_filter.filters_nodes(),
            ),
        );
        Self {
            event_generator: EventGenerator::new(query.clone()),
            processor: ViewProcessor::new(filter),
            query,
            view_cache,
            registrations: Vec::new(),
        }
    }

    pub(crate) fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// The complete server value, if known.
    pub(crate) fn server_cache(&self) -> Option<&Node> {
        self.view_cache.complete_server_snap()
    }

    /// The complete event value, if known.
    pub(crate) fn complete_node(&self) -> Option<&Node> {
        self.view_cache.complete_event_snap()
    }

    pub(crate) fn event_cache(&self) -> &IndexedNode {
        self.view_cache.event_cache().indexed_node()
    }

    /// The complete server value at `path` below the view, if this view
    /// knows it.
    pub(crate) fn complete_server_cache(&self, path: &Path) -> Option<Node> {
        let cache = self.view_cache.complete_server_snap()?;
        // A filtered view only knows the children it kept.
        let known = self.query.loads_all_data()
            || path
                .front()
                .is_some_and(|front| !cache.immediate_child(front).is_empty());
        known.then(|| cache.child(path))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub(crate) fn add_event_registration(&mut self, registration: Arc<dyn EventRegistration>) {
        self.registrations.push(registration);
    }

    /// Removes `registration` (every registration if `None`).
    ///
    /// With a `cancel_error`, every registration is removed and receives a
    /// cancel event.
    ///
    /// # Panics
    ///
    /// Panics if both a registration and a cancel error are given.
    pub(crate) fn remove_event_registration(
        &mut self,
        registration: Option<&dyn EventRegistration>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        let cancel_events = match cancel_error {
            Some(error) => {
                assert!(registration.is_none(), "a cancel removes every registration");
                self.registrations
                    .iter()
                    .map(|registration| {
                        Event::Cancel(CancelEvent {
                            registration: Arc::clone(registration),
                            error: error.clone(),
                            path: self.query.path().clone(),
                        })
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        match registration {
            Some(registration) => {
                let mut to_delete = None;
                for (position, candidate) in self.registrations.iter().enumerate() {
                    if candidate.is_same_listener(registration) {
                        to_delete = Some(position);
                        if candidate.is_zombied() {
                            break;
                        }
                    }
                }
                if let Some(position) = to_delete {
                    self.registrations.remove(position).zombify();
                }
            }
            None => {
                for registration in self.registrations.drain(..) {
                    registration.zombify();
                }
            }
        }
        cancel_events
    }

    /// Applies `operation` and returns the events for every registration.
    ///
    /// # Panics
    ///
    /// Panics on a tagged merge before the view has complete caches.
    pub(crate) fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_server_cache: Option<&Node>,
    ) -> ViewOperationResult {
        if let Operation::Merge { source, .. } = operation {
            if source.is_tagged() {
                assert!(
                    self.view_cache.complete_server_snap().is_some(),
                    "a tagged merge needs a complete server cache"
                );
                assert!(
                    self.view_cache.complete_event_snap().is_some(),
                    "missing event cache, even though the server cache is complete"
                );
            }
        }
        let result = self
            .processor
            .apply_operation(&self.view_cache, operation, writes, complete_server_cache);
        self.view_cache = result.view_cache;
        let events = self.event_generator.generate_events_for_changes(
            &result.changes,
            self.view_cache.event_cache().indexed_node(),
            &self.registrations,
        );
        ViewOperationResult {
            events,
            changes: result.changes,
        }
    }

    /// The events that bring a new registration up to date: one added
    /// event per child, then the value if it is complete.
    pub(crate) fn initial_events(&self, registration: &Arc<dyn EventRegistration>) -> Vec<DataEvent> {
        let event_snap = self.view_cache.event_cache();
        let mut changes: Vec<Change> = event_snap
            .indexed_node()
            .iter()
            .map(|child| {
                let (key, node) = child.into_parts();
                Change::child_added(key, node)
            })
            .collect();
        if event_snap.is_fully_initialized() {
            changes.push(Change::value(event_snap.indexed_node().clone()));
        }
        self.event_generator.generate_events_for_changes(
            &changes,
            event_snap.indexed_node(),
            std::slice::from_ref(registration),
        )
    }

    /// Keys of the children currently in the event cache.
    pub(crate) fn event_cache_keys(&self) -> impl Iterator<Item = ChildKey> + '_ {
        self.event_cache().iter().map(|child| child.name().clone())
    }
}

/// Keys of the children added and removed by `changes`.
pub(crate) fn tracked_key_changes(changes: &[Change]) -> (Vec<ChildKey>, Vec<ChildKey>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for change in changes {
        let Some(key) = change.child_key.clone() else {
            continue;
        };
        match change.event_type {
            EventType::ChildAdded => added.push(key),
            EventType::ChildRemoved => removed.push(key),
            _ => {}
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ValueEventListener, ValueEventRegistration};
    use crate::error::ListenerError;
    use crate::event::DataSnapshot;
    use crate::operation::OperationSource;
    use crate::write_tree::WriteTree;
    use serde_json::json;
    use treesync_core::{Index, QueryParams};

    #[derive(Debug)]
    struct Silent;

    impl ValueEventListener for Silent {
        fn on_data_change(&self, _snapshot: &DataSnapshot) -> Result<(), ListenerError> {
            Ok(())
        }

        fn on_cancelled(&self, _error: &DatabaseError) {}
    }

    fn n(value: serde_json::Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn cache(value: serde_json::Value, complete: bool) -> CacheNode {
        CacheNode::new(IndexedNode::from_node(n(value)), complete, false)
    }

    fn registration(query: &QuerySpec) -> Arc<dyn EventRegistration> {
        Arc::new(ValueEventRegistration::new(Arc::new(Silent), query.clone()))
    }

    #[test]
    fn new_view_filters_the_event_cache_only() {
        let query = QuerySpec::new(
            Path::parse("/list").unwrap(),
            QueryParams::new().order_by(Index::Value).limit_to_first(1),
        );
        let initial = ViewCache::new(cache(json!({"a": 2, "b": 1}), true), cache(json!({"a": 2, "b": 1}), true));
        let view = View::new(query, &initial);
        assert_eq!(view.complete_node(), Some(&n(json!({"b": 1}))));
        assert_eq!(view.server_cache(), Some(&n(json!({"a": 2, "b": 1}))));
        assert_eq!(view.event_cache_keys().collect::<Vec<_>>(), vec![ChildKey::new("b")]);
    }

    #[test]
    fn complete_server_cache_of_filtered_view() {
        let query = QuerySpec::new(Path::empty(), QueryParams::new().limit_to_first(5));
        let initial = ViewCache::new(cache(json!({"a": {"x": 1}}), true), cache(json!({"a": {"x": 1}}), true));
        let view = View::new(query, &initial);
        assert_eq!(
            view.complete_server_cache(&Path::parse("a/x").unwrap()),
            Some(n(json!(1)))
        );
        assert_eq!(view.complete_server_cache(&Path::parse("b").unwrap()), None);
        assert_eq!(view.complete_server_cache(&Path::empty()), None);

        let default = View::new(QuerySpec::default_at(Path::empty()), &initial);
        assert_eq!(default.complete_server_cache(&Path::parse("b").unwrap()), Some(Node::empty()));
    }

    #[test]
    fn initial_events_list_children_then_value() {
        let query = QuerySpec::default_at(Path::empty());
        let initial = ViewCache::new(cache(json!({"a": 1, "b": 2}), true), cache(json!({"a": 1, "b": 2}), true));
        let view = View::new(query.clone(), &initial);
        let events = view.initial_events(&registration(&query));
        // A value registration only sees the value event.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Value);

        let incomplete = View::new(query.clone(), &ViewCache::new(cache(json!({"a": 1}), false), cache(json!({}), false)));
        assert!(incomplete.initial_events(&registration(&query)).is_empty());
    }

    #[test]
    fn removing_registrations() {
        let query = QuerySpec::default_at(Path::empty());
        let initial = ViewCache::new(cache(json!({}), false), cache(json!({}), false));
        let mut view = View::new(query.clone(), &initial);
        let first = registration(&query);
        let second = registration(&query);
        view.add_event_registration(Arc::clone(&first));
        view.add_event_registration(Arc::clone(&second));

        assert!(view.remove_event_registration(Some(first.as_ref()), None).is_empty());
        assert!(first.is_zombied());
        assert!(!view.is_empty());

        let cancels = view.remove_event_registration(None, Some(&DatabaseError::permission_denied()));
        assert_eq!(cancels.len(), 1);
        assert!(view.is_empty());
        assert!(second.is_zombied());
    }

    #[test]
    fn operations_produce_events_for_registrations() {
        let query = QuerySpec::default_at(Path::empty());
        let initial = ViewCache::new(cache(json!({}), false), cache(json!({}), false));
        let mut view = View::new(query.clone(), &initial);
        view.add_event_registration(registration(&query));
        let writes = WriteTree::new();
        let result = view.apply_operation(
            &Operation::Overwrite {
                source: OperationSource::Server,
                path: Path::empty(),
                snapshot: n(json!({"a": 1})),
            },
            &writes.child_writes(&Path::empty()),
            None,
        );
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].snapshot.value(), json!({"a": 1}));
        assert_eq!(tracked_key_changes(&result.changes), (vec![ChildKey::new("a")], vec![]));
    }
}
