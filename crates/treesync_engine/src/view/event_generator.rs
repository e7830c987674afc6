//! Turns raw changes into ordered events for a view's registrations.

use std::sync::Arc;

use treesync_core::{IndexedNode, NamedNode, QuerySpec};

use super::change::Change;
use crate::event::{DataEvent, DataSnapshot, EventRegistration, EventType};

const EVENT_ORDER: [EventType; 5] = [
    EventType::ChildRemoved,
    EventType::ChildAdded,
    EventType::ChildMoved,
    EventType::ChildChanged,
    EventType::Value,
];

/// Builds the events for one query.
#[derive(Debug, Clone)]
pub(crate) struct EventGenerator {
    query: QuerySpec,
}

impl EventGenerator {
    pub(crate) fn new(query: QuerySpec) -> Self {
        Self { query }
    }

    /// Events for `changes`, grouped by type and sorted by the query
    /// index within each group.
    pub(crate) fn generate_events_for_changes(
        &self,
        changes: &[Change],
        event_cache: &IndexedNode,
        registrations: &[Arc<dyn EventRegistration>],
    ) -> Vec<DataEvent> {
        let index = self.query.index();
        let moves: Vec<Change> = changes
            .iter()
            .filter(|change| {
                change.event_type == EventType::ChildChanged
                    && change
                        .old_node
                        .as_ref()
                        .is_some_and(|old| index.indexed_value_changed(old, change.node()))
            })
            .filter_map(|change| {
                let key = change.child_key.clone()?;
                Some(Change::child_moved(key, change.node().clone()))
            })
            .collect();

        let mut events = Vec::new();
        for event_type in EVENT_ORDER {
            let source = if event_type == EventType::ChildMoved {
                &moves
            } else {
                changes
            };
            let mut of_type: Vec<&Change> =
                source.iter().filter(|change| change.event_type == event_type).collect();
            if event_type != EventType::Value {
                of_type.sort_by(|a, b| index.compare(&named(a), &named(b)));
            }
            for change in of_type {
                for registration in registrations {
                    if registration.responds_to(event_type) {
                        events.push(self.generate_event(change, registration, event_cache));
                    }
                }
            }
        }
        events
    }

    fn generate_event(
        &self,
        change: &Change,
        registration: &Arc<dyn EventRegistration>,
        event_cache: &IndexedNode,
    ) -> DataEvent {
        let (path, prev_name) = match &change.child_key {
            Some(key) => {
                let prev_name = if change.event_type == EventType::ChildRemoved {
                    None
                } else {
                    event_cache.predecessor_child_name(key, change.node())
                };
                (self.query.path().child(key), prev_name)
            }
            None => (self.query.path().clone(), None),
        };
        DataEvent {
            event_type: change.event_type,
            snapshot: DataSnapshot::new(
                path,
                IndexedNode::new(change.node().clone(), self.query.index().clone()),
            ),
            prev_name,
            registration: Arc::clone(registration),
        }
    }
}

fn named(change: &Change) -> NamedNode {
    let Some(key) = change.child_key.clone() else {
        panic!("child changes always carry a key");
    };
    NamedNode::new(key, change.node().clone())
}
