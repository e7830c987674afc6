//! Test fixtures: recording listeners, a recording listen provider and a
//! sync tree harness that raises its own events.

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use treesync_core::{Clock, CompoundWrite, ManualClock, Node, Path, QuerySpec, Tag, WriteId};
use treesync_engine::{
    ChildEventListener, ChildEventRegistration, DataSnapshot, DatabaseError, EngineConfig, Event, EventRaiser,
    EventRegistration, ListenProvider, ListenerError, ServerValues, SyncTree, ValueEventListener,
    ValueEventRegistration,
};
use treesync_persistence::PersistenceConfig;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Parses a path, panicking on malformed input.
pub fn path(s: &str) -> Path {
    Path::parse(s).expect("Invalid test path")
}

/// Imports a JSON value, panicking on malformed input.
pub fn node(value: Value) -> Node {
    Node::from_json(&value).expect("Invalid test value")
}

/// One callback received by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    /// A value event.
    Value(Value),
    /// A child entered the query.
    ChildAdded {
        /// The child's key.
        key: String,
        /// The child's value.
        value: Value,
        /// The preceding sibling.
        previous: Option<String>,
    },
    /// A child changed.
    ChildChanged {
        /// The child's key.
        key: String,
        /// The child's new value.
        value: Value,
        /// The preceding sibling.
        previous: Option<String>,
    },
    /// A child moved.
    ChildMoved {
        /// The child's key.
        key: String,
        /// The preceding sibling after the move.
        previous: Option<String>,
    },
    /// A child left the query.
    ChildRemoved {
        /// The child's key.
        key: String,
        /// The child's last value.
        value: Value,
    },
}

impl RecordedEvent {
    /// A short description such as `child_added b` or `value`.
    pub fn describe(&self) -> String {
        match self {
            Self::Value(_) => "value".to_string(),
            Self::ChildAdded { key, .. } => format!("child_added {key}"),
            Self::ChildChanged { key, .. } => format!("child_changed {key}"),
            Self::ChildMoved { key, .. } => format!("child_moved {key}"),
            Self::ChildRemoved { key, .. } => format!("child_removed {key}"),
        }
    }
}

/// A value and child listener that records every callback.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
    cancellations: Mutex<Vec<DatabaseError>>,
    fail: bool,
}

impl RecordingListener {
    /// A listener that accepts every event.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A listener whose callbacks all fail.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Returns and clears the received events.
    pub fn take_events(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Descriptions of the received events, cleared afterwards.
    pub fn take_summary(&self) -> Vec<String> {
        self.take_events().iter().map(RecordedEvent::describe).collect()
    }

    /// The values of the received value events.
    pub fn values(&self) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Value(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// The most recent value event.
    pub fn last_value(&self) -> Option<Value> {
        self.values().pop()
    }

    /// Errors delivered to the cancel callback.
    pub fn cancellations(&self) -> Vec<DatabaseError> {
        self.cancellations.lock().clone()
    }

    fn record(&self, event: RecordedEvent) -> Result<(), ListenerError> {
        self.events.lock().push(event);
        if self.fail {
            Err(ListenerError::new("recording listener configured to fail"))
        } else {
            Ok(())
        }
    }
}

fn key_of(snapshot: &DataSnapshot) -> String {
    snapshot.key().map(|key| key.as_str().to_string()).unwrap_or_default()
}

fn name_of(previous: Option<&treesync_core::ChildKey>) -> Option<String> {
    previous.map(|key| key.as_str().to_string())
}

impl ValueEventListener for RecordingListener {
    fn on_data_change(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError> {
        self.record(RecordedEvent::Value(snapshot.value()))
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.cancellations.lock().push(error.clone());
    }
}

impl ChildEventListener for RecordingListener {
    fn on_child_added(
        &self,
        snapshot: &DataSnapshot,
        previous: Option<&treesync_core::ChildKey>,
    ) -> Result<(), ListenerError> {
        self.record(RecordedEvent::ChildAdded {
            key: key_of(snapshot),
            value: snapshot.value(),
            previous: name_of(previous),
        })
    }

    fn on_child_changed(
        &self,
        snapshot: &DataSnapshot,
        previous: Option<&treesync_core::ChildKey>,
    ) -> Result<(), ListenerError> {
        self.record(RecordedEvent::ChildChanged {
            key: key_of(snapshot),
            value: snapshot.value(),
            previous: name_of(previous),
        })
    }

    fn on_child_removed(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError> {
        self.record(RecordedEvent::ChildRemoved {
            key: key_of(snapshot),
            value: snapshot.value(),
        })
    }

    fn on_child_moved(
        &self,
        snapshot: &DataSnapshot,
        previous: Option<&treesync_core::ChildKey>,
    ) -> Result<(), ListenerError> {
        self.record(RecordedEvent::ChildMoved {
            key: key_of(snapshot),
            previous: name_of(previous),
        })
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.cancellations.lock().push(error.clone());
    }
}

/// One call made to a [`RecordingListenProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum ListenCall {
    /// A listen was started.
    Start {
        /// The listened query.
        query: QuerySpec,
        /// The tag of a filtered listen.
        tag: Option<Tag>,
        /// Hash of the data already cached for the query.
        hash: String,
    },
    /// A listen was stopped.
    Stop {
        /// The listened query.
        query: QuerySpec,
        /// The tag of a filtered listen.
        tag: Option<Tag>,
    },
}

/// A listen provider that records calls instead of talking to a server.
#[derive(Debug, Default)]
pub struct RecordingListenProvider {
    calls: Mutex<Vec<ListenCall>>,
}

impl RecordingListenProvider {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<ListenCall> {
        self.calls.lock().clone()
    }

    /// Returns and clears the recorded calls.
    pub fn take_calls(&self) -> Vec<ListenCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Listens that were started and not stopped since, in start order.
    pub fn active(&self) -> Vec<(QuerySpec, Option<Tag>)> {
        let mut active: Vec<(QuerySpec, Option<Tag>)> = Vec::new();
        for call in self.calls.lock().iter() {
            match call {
                ListenCall::Start { query, tag, .. } => active.push((query.clone(), *tag)),
                ListenCall::Stop { query, tag } => {
                    active.retain(|(q, t)| !(q == query && t == tag));
                }
            }
        }
        active
    }

    /// The tag of the active listen for `query`, if it is filtered.
    pub fn tag_for(&self, query: &QuerySpec) -> Option<Tag> {
        self.active()
            .into_iter()
            .find(|(q, _)| q == query)
            .and_then(|(_, tag)| tag)
    }
}

impl ListenProvider for RecordingListenProvider {
    fn start_listening(&self, query: &QuerySpec, tag: Option<Tag>, hash: &str) {
        self.calls.lock().push(ListenCall::Start {
            query: query.clone(),
            tag,
            hash: hash.to_string(),
        });
    }

    fn stop_listening(&self, query: &QuerySpec, tag: Option<Tag>) {
        self.calls.lock().push(ListenCall::Stop {
            query: query.clone(),
            tag,
        });
    }
}

/// A sync tree with a manual clock and a recording listen provider that
/// raises every event it produces.
///
/// Operations panic on persistence failures.
pub struct TestTree {
    /// The tree under test.
    pub tree: SyncTree,
    /// Listens requested by the tree.
    pub listens: Arc<RecordingListenProvider>,
    /// The clock used for server values.
    pub clock: Arc<ManualClock>,
    raiser: EventRaiser,
    next_write_id: WriteId,
    _temp_dir: Option<TempDir>,
}

impl TestTree {
    /// A tree with persistence disabled.
    pub fn memory() -> Self {
        Self::with_config(&EngineConfig::new(), None)
    }

    /// A tree backed by an in-memory cache.
    pub fn cached() -> Self {
        let config = EngineConfig::new().persistence(PersistenceConfig::new().enabled(true));
        Self::with_config(&config, None)
    }

    /// A tree backed by a cache in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = EngineConfig::new().cache_dir(temp_dir.path());
        Self::with_config(&config, Some(temp_dir))
    }

    /// A tree backed by a cache in `dir`. Pending writes found there are
    /// restored and their events raised.
    pub fn open_dir(dir: &std::path::Path) -> Self {
        let mut tree = Self::with_config(&EngineConfig::new().cache_dir(dir), None);
        let restored = tree
            .tree
            .restore_user_writes(&*tree.clock)
            .expect("Failed to restore writes");
        tree.next_write_id = restored.next_write_id;
        tree.raise(restored.events);
        tree
    }

    fn with_config(config: &EngineConfig, temp_dir: Option<TempDir>) -> Self {
        let listens = RecordingListenProvider::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let tree = SyncTree::open(config, listens.clone(), clock.clone() as Arc<dyn Clock>)
            .expect("Failed to open sync tree");
        Self {
            tree,
            listens,
            clock,
            raiser: EventRaiser::new(),
            next_write_id: WriteId::new(1),
            _temp_dir: temp_dir,
        }
    }

    /// The temporary cache directory, for file-backed trees.
    pub fn dir(&self) -> Option<&std::path::Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Releases the tree and hands over its temporary directory, so the
    /// cache can be reopened.
    pub fn into_dir(self) -> Option<TempDir> {
        self._temp_dir
    }

    /// Raises `events` through the tree's event raiser.
    pub fn raise(&self, events: Vec<Event>) {
        self.raiser.raise_events(events);
    }

    /// Registers `listener` for value events on `query`.
    pub fn listen_value(
        &mut self,
        query: QuerySpec,
        listener: &Arc<RecordingListener>,
    ) -> Arc<dyn EventRegistration> {
        let registration: Arc<dyn EventRegistration> =
            Arc::new(ValueEventRegistration::new(listener.clone(), query));
        self.add(registration)
    }

    /// Registers `listener` for child events on `query`.
    pub fn listen_children(
        &mut self,
        query: QuerySpec,
        listener: &Arc<RecordingListener>,
    ) -> Arc<dyn EventRegistration> {
        let registration: Arc<dyn EventRegistration> =
            Arc::new(ChildEventRegistration::new(listener.clone(), query));
        self.add(registration)
    }

    fn add(&mut self, registration: Arc<dyn EventRegistration>) -> Arc<dyn EventRegistration> {
        let events = self
            .tree
            .add_event_registration(Arc::clone(&registration))
            .expect("Failed to add registration");
        self.raise(events);
        registration
    }

    /// Removes a registration.
    pub fn unlisten(&mut self, registration: &Arc<dyn EventRegistration>) {
        let events = self
            .tree
            .remove_event_registration(registration.as_ref())
            .expect("Failed to remove registration");
        self.raise(events);
    }

    /// Writes `value` at `at` locally and returns the write id.
    pub fn set(&mut self, at: &str, value: Value) -> WriteId {
        let at = path(at);
        let unresolved = node(value);
        let existing = self.tree.calc_complete_event_cache(&at, &[]).unwrap_or_default();
        let resolved = ServerValues::generate(&*self.clock).resolve_node(&unresolved, &existing);
        let write_id = self.take_write_id();
        let events = self
            .tree
            .apply_user_overwrite(&at, &unresolved, resolved, write_id, true, true)
            .expect("Failed to apply user overwrite");
        self.raise(events);
        write_id
    }

    /// Updates several descendants of `at` locally. `children` is an object
    /// keyed by relative paths.
    pub fn update(&mut self, at: &str, children: Value) -> WriteId {
        let at = path(at);
        let unresolved = merge_of(children);
        let existing = self.tree.calc_complete_event_cache(&at, &[]).unwrap_or_default();
        let resolved = ServerValues::generate(&*self.clock).resolve_merge(&unresolved, &existing);
        let write_id = self.take_write_id();
        let events = self
            .tree
            .apply_user_merge(&at, &unresolved, &resolved, write_id, true)
            .expect("Failed to apply user merge");
        self.raise(events);
        write_id
    }

    /// Acknowledges a write.
    pub fn ack(&mut self, write_id: WriteId) {
        let events = self
            .tree
            .ack_user_write(write_id, false, true, &*self.clock)
            .expect("Failed to ack write");
        self.raise(events);
    }

    /// Rejects a write.
    pub fn revert(&mut self, write_id: WriteId) {
        let events = self
            .tree
            .ack_user_write(write_id, true, true, &*self.clock)
            .expect("Failed to revert write");
        self.raise(events);
    }

    /// Delivers server data for `at`.
    pub fn server_set(&mut self, at: &str, value: Value) {
        let events = self
            .tree
            .apply_server_overwrite(&path(at), node(value))
            .expect("Failed to apply server overwrite");
        self.raise(events);
    }

    /// Delivers a server update of several descendants of `at`.
    pub fn server_update(&mut self, at: &str, children: Value) {
        let events = self
            .tree
            .apply_server_merge(&path(at), merge_of(children))
            .expect("Failed to apply server merge");
        self.raise(events);
    }

    /// Reports that the default listen at `at` is complete.
    pub fn listen_complete(&mut self, at: &str) {
        let events = self
            .tree
            .apply_listen_complete(&path(at))
            .expect("Failed to complete listen");
        self.raise(events);
    }

    /// The value at `at` as listeners would see it.
    pub fn value_at(&self, at: &str) -> Option<Value> {
        self.tree
            .calc_complete_event_cache(&path(at), &[])
            .map(|node| node.to_json())
    }

    fn take_write_id(&mut self) -> WriteId {
        let write_id = self.next_write_id;
        self.next_write_id = write_id.next();
        write_id
    }
}

impl std::ops::Deref for TestTree {
    type Target = SyncTree;

    fn deref(&self) -> &Self::Target {
        &self.tree
    }
}

impl std::ops::DerefMut for TestTree {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tree
    }
}

/// Builds a disjoint merge from an object keyed by relative paths.
pub fn merge_of(children: Value) -> CompoundWrite {
    let Value::Object(map) = children else {
        panic!("a merge must be a JSON object");
    };
    CompoundWrite::from_disjoint_merge(
        map.into_iter()
            .map(|(key, value)| (path(&key), node(value)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tree_raises_events() {
        init_tracing();
        let mut tree = TestTree::memory();
        let listener = RecordingListener::new();
        tree.listen_value(QuerySpec::default_at(path("a")), &listener);
        tree.server_set("a", json!({"x": 1}));
        assert_eq!(listener.values(), vec![json!({"x": 1})]);
        assert_eq!(tree.listens.active().len(), 1);
    }

    #[test]
    fn write_ids_increase() {
        let mut tree = TestTree::memory();
        let first = tree.set("a", json!(1));
        let second = tree.update("b", json!({"c": 2}));
        assert!(first < second);
        assert_eq!(tree.pending_writes().len(), 2);
    }

    #[test]
    fn listen_provider_tracks_active_listens() {
        let provider = RecordingListenProvider::new();
        let query = QuerySpec::default_at(path("q"));
        provider.start_listening(&query, None, "h");
        assert_eq!(provider.active(), vec![(query.clone(), None)]);
        provider.stop_listening(&query, None);
        assert!(provider.active().is_empty());
        assert_eq!(provider.calls().len(), 2);
    }

    #[test]
    fn failing_listener_records_then_fails() {
        let listener = RecordingListener::failing();
        let snapshot = DataSnapshot::new(
            path("a"),
            treesync_core::IndexedNode::from_node(node(json!(1))),
        );
        assert!(listener.on_data_change(&snapshot).is_err());
        assert_eq!(listener.take_summary(), vec!["value"]);
    }
}
