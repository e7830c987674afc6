//! Events, listeners and their registrations.
//!
//! A registration ties a listener to one query. The sync tree produces
//! [`Event`]s addressed to registrations; [`EventRaiser`] delivers them.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use treesync_core::{ChildKey, IndexedNode, Node, Path, QuerySpec};

use crate::error::{DatabaseError, ListenerError};

/// Kinds of data events, in the order they are raised for one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// A child left the query.
    ChildRemoved,
    /// A child entered the query.
    ChildAdded,
    /// A child changed position in the query order.
    ChildMoved,
    /// A child's value changed.
    ChildChanged,
    /// The whole value at the query location.
    Value,
}

/// An immutable copy of the data at a location, ordered by the query index.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSnapshot {
    path: Path,
    node: IndexedNode,
}

impl DataSnapshot {
    /// Wraps `node` as the data at `path`.
    pub fn new(path: Path, node: IndexedNode) -> Self {
        Self { path, node }
    }

    /// The location of the data.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last path component, or `None` at the root.
    pub fn key(&self) -> Option<&ChildKey> {
        self.path.back()
    }

    /// The raw node.
    pub fn node(&self) -> &Node {
        self.node.node()
    }

    /// The data as plain JSON.
    pub fn value(&self) -> Value {
        self.node.node().to_json()
    }

    /// The data as JSON with `.priority` markers.
    pub fn export_value(&self) -> Value {
        self.node.node().to_export_json()
    }

    /// True if the location holds any data.
    pub fn exists(&self) -> bool {
        !self.node.node().is_empty()
    }

    /// Number of immediate children.
    pub fn children_count(&self) -> usize {
        self.node.node().child_count()
    }

    /// The data at `path` below this snapshot.
    pub fn child(&self, path: &Path) -> DataSnapshot {
        DataSnapshot {
            path: self.path.join(path),
            node: IndexedNode::new(self.node.node().child(path), self.node.index().clone()),
        }
    }

    /// Immediate children in query order.
    pub fn children(&self) -> Vec<DataSnapshot> {
        self.node
            .iter()
            .map(|child| {
                let (key, node) = child.into_parts();
                DataSnapshot {
                    path: self.path.child(&key),
                    node: IndexedNode::new(node, self.node.index().clone()),
                }
            })
            .collect()
    }
}

/// Receives the value at a query location.
pub trait ValueEventListener: Send + Sync {
    /// Called with the new value.
    ///
    /// # Errors
    ///
    /// A failing listener is cancelled and receives no further events.
    fn on_data_change(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError>;

    /// Called once when the listen is cancelled.
    fn on_cancelled(&self, error: &DatabaseError);
}

/// Receives child-level changes at a query location.
///
/// `previous` names the sibling ordered right before the child, if any.
pub trait ChildEventListener: Send + Sync {
    /// A child entered the query.
    fn on_child_added(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError>;

    /// A child's value changed.
    fn on_child_changed(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError>;

    /// A child left the query.
    fn on_child_removed(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError>;

    /// A child moved within the query order.
    fn on_child_moved(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError>;

    /// Called once when the listen is cancelled.
    fn on_cancelled(&self, error: &DatabaseError);
}

/// A listener attached to one query.
pub trait EventRegistration: Send + Sync + fmt::Debug {
    /// True if the registration wants events of this type.
    fn responds_to(&self, event_type: EventType) -> bool;

    /// Delivers a data event to the listener.
    ///
    /// # Errors
    ///
    /// Returns the listener's error.
    fn fire_event(&self, event: &DataEvent) -> Result<(), ListenerError>;

    /// Tells the listener that its listen was cancelled.
    fn fire_cancel_event(&self, error: &DatabaseError);

    /// The query the listener is attached to.
    fn query_spec(&self) -> &QuerySpec;

    /// True if both registrations wrap the same listener.
    fn is_same_listener(&self, other: &dyn EventRegistration) -> bool;

    /// Marks the registration as removed. Removed registrations receive no
    /// further data events.
    fn zombify(&self);

    /// True once the registration has been removed.
    fn is_zombied(&self) -> bool;

    /// Downcasting support for [`EventRegistration::is_same_listener`].
    fn as_any(&self) -> &dyn Any;
}

/// Registers a [`ValueEventListener`].
pub struct ValueEventRegistration {
    listener: Arc<dyn ValueEventListener>,
    query: QuerySpec,
    zombied: AtomicBool,
}

impl ValueEventRegistration {
    /// Attaches `listener` to `query`.
    pub fn new(listener: Arc<dyn ValueEventListener>, query: QuerySpec) -> Self {
        Self {
            listener,
            query,
            zombied: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ValueEventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueEventRegistration")
            .field("query", &self.query)
            .field("zombied", &self.is_zombied())
            .finish_non_exhaustive()
    }
}

impl EventRegistration for ValueEventRegistration {
    fn responds_to(&self, event_type: EventType) -> bool {
        event_type == EventType::Value
    }

    fn fire_event(&self, event: &DataEvent) -> Result<(), ListenerError> {
        self.listener.on_data_change(&event.snapshot)
    }

    fn fire_cancel_event(&self, error: &DatabaseError) {
        self.listener.on_cancelled(error);
    }

    fn query_spec(&self) -> &QuerySpec {
        &self.query
    }

    fn is_same_listener(&self, other: &dyn EventRegistration) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| Arc::ptr_eq(&other.listener, &self.listener))
    }

    fn zombify(&self) {
        self.zombied.store(true, Ordering::Release);
    }

    fn is_zombied(&self) -> bool {
        self.zombied.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registers a [`ChildEventListener`].
pub struct ChildEventRegistration {
    listener: Arc<dyn ChildEventListener>,
    query: QuerySpec,
    zombied: AtomicBool,
}

impl ChildEventRegistration {
    /// Attaches `listener` to `query`.
    pub fn new(listener: Arc<dyn ChildEventListener>, query: QuerySpec) -> Self {
        Self {
            listener,
            query,
            zombied: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ChildEventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildEventRegistration")
            .field("query", &self.query)
            .field("zombied", &self.is_zombied())
            .finish_non_exhaustive()
    }
}

impl EventRegistration for ChildEventRegistration {
    fn responds_to(&self, event_type: EventType) -> bool {
        event_type != EventType::Value
    }

    fn fire_event(&self, event: &DataEvent) -> Result<(), ListenerError> {
        let previous = event.prev_name.as_ref();
        match event.event_type {
            EventType::ChildAdded => self.listener.on_child_added(&event.snapshot, previous),
            EventType::ChildChanged => self.listener.on_child_changed(&event.snapshot, previous),
            EventType::ChildMoved => self.listener.on_child_moved(&event.snapshot, previous),
            EventType::ChildRemoved => self.listener.on_child_removed(&event.snapshot),
            EventType::Value => Ok(()),
        }
    }

    fn fire_cancel_event(&self, error: &DatabaseError) {
        self.listener.on_cancelled(error);
    }

    fn query_spec(&self) -> &QuerySpec {
        &self.query
    }

    fn is_same_listener(&self, other: &dyn EventRegistration) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| Arc::ptr_eq(&other.listener, &self.listener))
    }

    fn zombify(&self) {
        self.zombied.store(true, Ordering::Release);
    }

    fn is_zombied(&self) -> bool {
        self.zombied.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Keeps a query's listen open without a listener.
#[derive(Debug)]
pub(crate) struct KeepSyncedRegistration {
    query: QuerySpec,
}

impl KeepSyncedRegistration {
    pub(crate) fn new(query: QuerySpec) -> Self {
        Self { query }
    }
}

impl EventRegistration for KeepSyncedRegistration {
    fn responds_to(&self, _event_type: EventType) -> bool {
        false
    }

    fn fire_event(&self, _event: &DataEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    fn fire_cancel_event(&self, _error: &DatabaseError) {}

    fn query_spec(&self) -> &QuerySpec {
        &self.query
    }

    fn is_same_listener(&self, other: &dyn EventRegistration) -> bool {
        other.as_any().downcast_ref::<Self>().is_some()
    }

    fn zombify(&self) {}

    fn is_zombied(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A data change addressed to one registration.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// What kind of change this is.
    pub event_type: EventType,
    /// The data: the whole location for value events, the child otherwise.
    pub snapshot: DataSnapshot,
    /// The sibling ordered right before the child, for added, changed and
    /// moved events.
    pub prev_name: Option<ChildKey>,
    /// Who receives the event.
    pub registration: Arc<dyn EventRegistration>,
}

/// Notice that a registration's listen was cancelled.
#[derive(Debug, Clone)]
pub struct CancelEvent {
    /// Who receives the event.
    pub registration: Arc<dyn EventRegistration>,
    /// Why the listen was cancelled.
    pub error: DatabaseError,
    /// The listened location.
    pub path: Path,
}

/// Anything the sync tree asks to be raised.
#[derive(Debug, Clone)]
pub enum Event {
    /// A data change.
    Data(DataEvent),
    /// A cancelled listen.
    Cancel(CancelEvent),
}

impl Event {
    /// The registration the event is addressed to.
    pub fn registration(&self) -> &Arc<dyn EventRegistration> {
        match self {
            Self::Data(event) => &event.registration,
            Self::Cancel(event) => &event.registration,
        }
    }

    /// The location the event is about.
    pub fn path(&self) -> &Path {
        match self {
            Self::Data(event) => event.snapshot.path(),
            Self::Cancel(event) => &event.path,
        }
    }

    /// The data event, if this is one.
    pub fn as_data(&self) -> Option<&DataEvent> {
        match self {
            Self::Data(event) => Some(event),
            Self::Cancel(_) => None,
        }
    }
}

/// Delivers events to their registrations in order.
#[derive(Debug, Default)]
pub struct EventRaiser;

impl EventRaiser {
    /// Creates a raiser.
    pub fn new() -> Self {
        Self
    }

    /// Fires every event in order.
    ///
    /// Data events for removed registrations are dropped. A listener that
    /// fails is sent a cancel event and removed; delivery to the others
    /// continues.
    pub fn raise_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        debug!(count = events.len(), "raising events");
        for event in events {
            match event {
                Event::Data(event) => {
                    if event.registration.is_zombied() {
                        continue;
                    }
                    if let Err(error) = event.registration.fire_event(&event) {
                        warn!(
                            path = %event.snapshot.path(),
                            event_type = ?event.event_type,
                            error = %error,
                            "listener failed, cancelling it"
                        );
                        event
                            .registration
                            .fire_cancel_event(&DatabaseError::from_listener(&error));
                        event.registration.zombify();
                    }
                }
                Event::Cancel(event) => event.registration.fire_cancel_event(&event.error),
            }
        }
    }
}
