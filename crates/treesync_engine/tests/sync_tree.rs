//! End-to-end sync tree scenarios.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::tempdir;
use treesync_core::{
    ChildKey, CompoundWrite, ManualClock, Node, Path, QueryParams, QuerySpec, Tag, WriteId,
};
use treesync_engine::{
    ChildEventListener, ChildEventRegistration, DataSnapshot, DatabaseError, EngineConfig, Event, EventRaiser,
    EventRegistration, ListenProvider, ListenerError, SyncTree, ValueEventListener, ValueEventRegistration,
};
use treesync_persistence::{NoopPersistenceManager, PersistenceManager};

fn p(s: &str) -> Path {
    Path::parse(s).unwrap()
}

fn n(value: Value) -> Node {
    Node::from_json(&value).unwrap()
}

#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
    values: Mutex<Vec<Value>>,
    cancelled: Mutex<Vec<DatabaseError>>,
    fail: bool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock())
    }

    fn last_value(&self) -> Option<Value> {
        self.values.lock().last().cloned()
    }

    fn push(&self, entry: String) -> Result<(), ListenerError> {
        self.log.lock().push(entry);
        if self.fail {
            Err(ListenerError::new("listener exploded"))
        } else {
            Ok(())
        }
    }
}

fn describe(kind: &str, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> String {
    let key = snapshot.key().map_or("", ChildKey::as_str);
    match previous {
        Some(previous) => format!("{kind} {key} after {}", previous.as_str()),
        None => format!("{kind} {key}"),
    }
}

impl ValueEventListener for Recorder {
    fn on_data_change(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError> {
        self.values.lock().push(snapshot.value());
        self.push("value".to_string())
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.cancelled.lock().push(error.clone());
    }
}

impl ChildEventListener for Recorder {
    fn on_child_added(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        self.push(describe("added", snapshot, previous))
    }

    fn on_child_changed(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        self.push(describe("changed", snapshot, previous))
    }

    fn on_child_removed(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError> {
        self.push(describe("removed", snapshot, None))
    }

    fn on_child_moved(&self, snapshot: &DataSnapshot, previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        self.push(describe("moved", snapshot, previous))
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.cancelled.lock().push(error.clone());
    }
}

#[derive(Debug, Default)]
struct Listens(Mutex<Vec<(String, QuerySpec, Option<Tag>)>>);

impl Listens {
    fn take(&self) -> Vec<(String, QuerySpec, Option<Tag>)> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl ListenProvider for Listens {
    fn start_listening(&self, query: &QuerySpec, tag: Option<Tag>, _hash: &str) {
        self.0.lock().push(("start".to_string(), query.clone(), tag));
    }

    fn stop_listening(&self, query: &QuerySpec, tag: Option<Tag>) {
        self.0.lock().push(("stop".to_string(), query.clone(), tag));
    }
}

struct Harness {
    tree: SyncTree,
    listens: Arc<Listens>,
    clock: ManualClock,
    raiser: EventRaiser,
}

impl Harness {
    fn new() -> Self {
        let listens = Arc::new(Listens::default());
        Self {
            tree: SyncTree::new(Arc::new(NoopPersistenceManager::new()), listens.clone()),
            listens,
            clock: ManualClock::new(1_000),
            raiser: EventRaiser::new(),
        }
    }

    fn raise(&self, events: Vec<Event>) {
        self.raiser.raise_events(events);
    }

    fn value(&mut self, query: QuerySpec, listener: &Arc<Recorder>) -> Arc<dyn EventRegistration> {
        let registration: Arc<dyn EventRegistration> = Arc::new(ValueEventRegistration::new(listener.clone(), query));
        let events = self.tree.add_event_registration(registration.clone()).unwrap();
        self.raise(events);
        registration
    }

    fn children(&mut self, query: QuerySpec, listener: &Arc<Recorder>) -> Arc<dyn EventRegistration> {
        let registration: Arc<dyn EventRegistration> = Arc::new(ChildEventRegistration::new(listener.clone(), query));
        let events = self.tree.add_event_registration(registration.clone()).unwrap();
        self.raise(events);
        registration
    }

    fn user_set(&mut self, path: &str, value: Value, write_id: u64) {
        let node = n(value);
        let events = self
            .tree
            .apply_user_overwrite(&p(path), &node, node.clone(), WriteId::new(write_id), true, true)
            .unwrap();
        self.raise(events);
    }

    fn server_set(&mut self, path: &str, value: Value) {
        let events = self.tree.apply_server_overwrite(&p(path), n(value)).unwrap();
        self.raise(events);
    }

    fn ack(&mut self, write_id: u64, revert: bool) -> usize {
        let events = self
            .tree
            .ack_user_write(WriteId::new(write_id), revert, true, &self.clock)
            .unwrap();
        let count = events.len();
        self.raise(events);
        count
    }
}

#[test]
fn acknowledging_a_matching_write_raises_nothing() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("a")), &listener);

    let merge = CompoundWrite::from_child_merge(vec![(ChildKey::new("foo"), n(json!(1)))]);
    let events = h
        .tree
        .apply_user_merge(&p("a"), &merge, &merge, WriteId::new(1), true)
        .unwrap();
    h.raise(events);
    assert!(listener.take_log().is_empty());

    h.server_set("a", json!({"foo": 1, "bar": 2}));
    assert_eq!(listener.take_log(), vec!["value"]);
    assert_eq!(listener.last_value(), Some(json!({"foo": 1, "bar": 2})));

    assert_eq!(h.ack(1, false), 0);
    assert!(listener.take_log().is_empty());
    assert_eq!(
        h.tree.calc_complete_event_cache(&p("a"), &[]),
        Some(n(json!({"foo": 1, "bar": 2})))
    );
}

#[test]
fn overwrite_hides_server_data_until_acknowledged() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("a")), &listener);

    h.user_set("a", json!({"foo": 1}), 1);
    h.server_set("a", json!({"foo": 1, "bar": 2}));
    assert_eq!(listener.take_log(), vec!["value"]);
    assert_eq!(h.tree.calc_complete_event_cache(&p("a"), &[]), Some(n(json!({"foo": 1}))));

    h.ack(1, false);
    assert_eq!(listener.take_log(), vec!["value"]);
    assert_eq!(listener.last_value(), Some(json!({"foo": 1, "bar": 2})));
}

#[test]
fn server_data_under_a_pending_write_stays_hidden() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("a")), &listener);
    h.server_set("a", json!({"foo": 0, "bar": 2}));
    h.user_set("a/foo", json!(1), 1);
    assert_eq!(listener.last_value(), Some(json!({"foo": 1, "bar": 2})));

    listener.take_log();
    h.server_set("a/foo", json!(5));
    assert!(listener.take_log().is_empty(), "the write still shadows foo");

    h.ack(1, true);
    assert_eq!(listener.last_value(), Some(json!({"foo": 5, "bar": 2})));
}

#[test]
fn child_events_are_ordered_and_carry_previous_names() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.children(QuerySpec::default_at(p("list")), &listener);

    h.server_set("list", json!({"a": 1, "b": 2}));
    assert_eq!(listener.take_log(), vec!["added a", "added b after a"]);

    h.user_set("list/c", json!(3), 1);
    assert_eq!(listener.take_log(), vec!["added c after b"]);

    h.user_set("list", json!({"b": 20, "c": 3}), 2);
    assert_eq!(listener.take_log(), vec!["removed a", "changed b"]);

    h.ack(2, true);
    assert_eq!(listener.take_log(), vec!["added a", "changed b after a"]);
}

#[test]
fn limited_query_slides_its_window() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    let query = QuerySpec::new(p("scores"), QueryParams::new().limit_to_last(2));
    h.children(query.clone(), &listener);

    let started = h.listens.take();
    assert_eq!(started.len(), 1);
    let (kind, listened, tag) = &started[0];
    assert_eq!(kind, "start");
    assert_eq!(listened, &query);
    let tag = tag.expect("filtered listens are tagged");

    let events = h
        .tree
        .apply_tagged_query_overwrite(&p("scores"), n(json!({"a": 1, "b": 2, "c": 3})), tag)
        .unwrap();
    h.raise(events);
    assert_eq!(listener.take_log(), vec!["added b", "added c after b"]);

    let merge = CompoundWrite::from_child_merge(vec![(ChildKey::new("d"), n(json!(4)))]);
    let events = h.tree.apply_tagged_query_merge(&p("scores"), merge, tag).unwrap();
    h.raise(events);
    assert_eq!(listener.take_log(), vec!["removed b", "added d after c"]);
}

#[test]
fn default_listen_shadows_and_restores_filtered_listens() {
    let mut h = Harness::new();
    let filtered = QuerySpec::new(p("a/b"), QueryParams::new().limit_to_first(1));
    let listener = Recorder::new();
    h.value(filtered.clone(), &listener);
    let parent = h.value(QuerySpec::default_at(p("a")), &listener);

    let calls: Vec<(String, Path)> = h
        .listens
        .take()
        .into_iter()
        .map(|(kind, query, _)| (kind, query.path().clone()))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("start".to_string(), p("a/b")),
            ("start".to_string(), p("a")),
            ("stop".to_string(), p("a/b")),
        ]
    );

    let events = h.tree.remove_event_registration(parent.as_ref()).unwrap();
    h.raise(events);
    let calls: Vec<(String, Path)> = h
        .listens
        .take()
        .into_iter()
        .map(|(kind, query, _)| (kind, query.path().clone()))
        .collect();
    assert_eq!(
        calls,
        vec![("start".to_string(), p("a/b")), ("stop".to_string(), p("a"))]
    );
}

#[test]
fn nested_listen_under_default_listen_does_not_listen_again() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("a")), &listener);
    h.value(QuerySpec::default_at(p("a/b")), &listener);
    assert_eq!(h.listens.take().len(), 1);
}

#[test]
fn failing_listener_is_isolated() {
    let mut h = Harness::new();
    let failing = Recorder::failing();
    let healthy = Recorder::new();
    let query = QuerySpec::default_at(p("room"));
    h.value(query.clone(), &failing);
    h.value(query, &healthy);

    h.server_set("room", json!("one"));
    h.server_set("room", json!("two"));

    assert_eq!(failing.values.lock().len(), 1);
    assert_eq!(failing.cancelled.lock()[0].code(), DatabaseError::USER_CODE_EXCEPTION);
    assert_eq!(*healthy.values.lock(), vec![json!("one"), json!("two")]);
}

#[test]
fn failed_listen_cancels_its_registrations() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    let query = QuerySpec::default_at(p("secret"));
    h.value(query.clone(), &listener);
    h.listens.take();

    let events = h
        .tree
        .on_listen_complete(&query, None, Err(DatabaseError::permission_denied()))
        .unwrap();
    assert!(events.iter().all(|event| matches!(event, Event::Cancel(_))));
    h.raise(events);
    assert_eq!(listener.cancelled.lock()[0].code(), DatabaseError::PERMISSION_DENIED);
    assert!(h.listens.take().is_empty(), "a cancelled listen is already closed");

    h.server_set("secret", json!(1));
    assert!(listener.take_log().is_empty());
}

#[test]
fn listen_complete_makes_empty_data_visible() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("empty")), &listener);
    let events = h
        .tree
        .on_listen_complete(&QuerySpec::default_at(p("empty")), None, Ok(()))
        .unwrap();
    h.raise(events);
    assert_eq!(listener.last_value(), Some(Value::Null));
}

#[test]
fn keep_synced_holds_a_listen_open() {
    let mut h = Harness::new();
    let query = QuerySpec::default_at(p("synced"));
    h.tree.keep_synced(&query, true).unwrap();
    h.tree.keep_synced(&query, true).unwrap();
    assert_eq!(h.listens.take().len(), 1);

    h.server_set("synced", json!({"x": 1}));
    assert_eq!(
        h.tree.server_value(&query).unwrap(),
        Some(n(json!({"x": 1})))
    );

    h.tree.keep_synced(&query, false).unwrap();
    let calls = h.listens.take();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "stop");
}

#[test]
fn removing_all_writes_reverts_them() {
    let mut h = Harness::new();
    let listener = Recorder::new();
    h.value(QuerySpec::default_at(p("doc")), &listener);
    h.server_set("doc", json!({"title": "server"}));
    h.user_set("doc/title", json!("draft"), 1);
    h.user_set("doc/body", json!("text"), 2);
    assert_eq!(listener.last_value(), Some(json!({"title": "draft", "body": "text"})));

    let events = h.tree.remove_all_user_writes().unwrap();
    h.raise(events);
    assert_eq!(listener.last_value(), Some(json!({"title": "server"})));
    assert!(h.tree.pending_writes().is_empty());
}

#[test]
fn acknowledged_writes_reach_the_local_cache() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_234));
    let config = EngineConfig::new().cache_dir(dir.path());
    let mut tree = SyncTree::open(&config, Arc::new(Listens::default()), clock.clone()).unwrap();

    let unresolved = n(json!({".sv": "timestamp"}));
    tree.apply_user_overwrite(&p("meta/at"), &unresolved, n(json!(1_234)), WriteId::new(1), true, true)
        .unwrap();
    tree.ack_user_write(WriteId::new(1), false, true, clock.as_ref()).unwrap();

    let cached = tree
        .persistence()
        .server_cache(&QuerySpec::default_at(p("meta")))
        .unwrap();
    assert!(!cached.is_fully_initialized());
    assert_eq!(cached.node().to_json(), json!({"at": 1234}));
    assert!(tree.persistence().load_user_writes().unwrap().is_empty());
}

#[test]
fn pending_writes_survive_a_restart() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(50));
    let config = EngineConfig::new().cache_dir(dir.path());
    let query = QuerySpec::default_at(p("a"));
    {
        let mut tree = SyncTree::open(&config, Arc::new(Listens::default()), clock.clone()).unwrap();
        let registration: Arc<dyn EventRegistration> =
            Arc::new(ValueEventRegistration::new(Recorder::new(), query.clone()));
        tree.add_event_registration(registration).unwrap();
        tree.apply_server_overwrite(&p("a"), n(json!({"x": 1}))).unwrap();
        tree.apply_user_overwrite(&p("a/y"), &n(json!(2)), n(json!(2)), WriteId::new(1), true, true)
            .unwrap();
    }

    let mut tree = SyncTree::open(&config, Arc::new(Listens::default()), clock.clone()).unwrap();
    let restored = tree.restore_user_writes(clock.as_ref()).unwrap();
    assert_eq!(restored.writes.len(), 1);
    assert_eq!(restored.next_write_id, WriteId::new(2));
    assert_eq!(tree.server_value(&query).unwrap(), Some(n(json!({"x": 1, "y": 2}))));

    let listener = Recorder::new();
    let registration: Arc<dyn EventRegistration> =
        Arc::new(ValueEventRegistration::new(listener.clone(), query));
    let events = tree.add_event_registration(registration).unwrap();
    EventRaiser::new().raise_events(events);
    assert_eq!(listener.last_value(), Some(json!({"x": 1, "y": 2})));
}
