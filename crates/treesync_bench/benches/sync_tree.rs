//! Sync tree benchmarks.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::json;
use treesync_bench::utils::{numbered_children, random_writes};
use treesync_core::{ChildKey, ManualClock, Node, Path, QueryParams, QuerySpec, WriteId};
use treesync_engine::{
    ChildEventListener, ChildEventRegistration, DataSnapshot, DatabaseError, EventRegistration, ListenerError,
    OfflineListenProvider, SyncTree,
};
use treesync_persistence::NoopPersistenceManager;

struct Discard;

impl ChildEventListener for Discard {
    fn on_child_added(&self, snapshot: &DataSnapshot, _previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        black_box(snapshot);
        Ok(())
    }

    fn on_child_changed(&self, snapshot: &DataSnapshot, _previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        black_box(snapshot);
        Ok(())
    }

    fn on_child_removed(&self, snapshot: &DataSnapshot) -> Result<(), ListenerError> {
        black_box(snapshot);
        Ok(())
    }

    fn on_child_moved(&self, snapshot: &DataSnapshot, _previous: Option<&ChildKey>) -> Result<(), ListenerError> {
        black_box(snapshot);
        Ok(())
    }

    fn on_cancelled(&self, _error: &DatabaseError) {}
}

fn tree() -> SyncTree {
    SyncTree::new(Arc::new(NoopPersistenceManager::new()), Arc::new(OfflineListenProvider))
}

fn listening_tree(query: QuerySpec) -> SyncTree {
    let mut tree = tree();
    let registration: Arc<dyn EventRegistration> = Arc::new(ChildEventRegistration::new(Arc::new(Discard), query));
    tree.add_event_registration(registration).unwrap();
    tree
}

/// Benchmark server overwrites reaching a listened location.
fn bench_server_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_overwrite");
    let path = Path::parse("feed").unwrap();

    for count in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let data = numbered_children(count);
            b.iter_batched(
                || listening_tree(QuerySpec::default_at(path.clone())),
                |mut tree| {
                    let events = tree.apply_server_overwrite(&path, data.clone()).unwrap();
                    black_box(events);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

/// Benchmark a limited query absorbing new children.
fn bench_limited_query(c: &mut Criterion) {
    let path = Path::parse("feed").unwrap();
    let query = QuerySpec::new(path.clone(), QueryParams::new().limit_to_last(20));

    c.bench_function("limited_query_append", |b| {
        let mut tree = listening_tree(query.clone());
        tree.apply_server_overwrite(&path, numbered_children(500)).unwrap();
        let mut next = 500_i64;
        b.iter(|| {
            let child = path.child(&ChildKey::new(&format!("item{next:06}")));
            next += 1;
            let events = tree.apply_server_overwrite(&child, Node::from(next)).unwrap();
            black_box(events);
        });
    });
}

/// Benchmark a user write followed by its acknowledgement.
fn bench_write_and_ack(c: &mut Criterion) {
    let clock = ManualClock::new(0);
    let path = Path::parse("doc").unwrap();

    c.bench_function("user_write_ack", |b| {
        let mut tree = listening_tree(QuerySpec::default_at(path.clone()));
        let seed = Node::from_json(&json!({"title": "draft", "body": "text"})).unwrap();
        tree.apply_server_overwrite(&path, seed).unwrap();
        let writes = random_writes(64, 2, 4);
        let mut write_id = WriteId::new(1);
        let mut i = 0;
        b.iter(|| {
            let (relative, node) = &writes[i % writes.len()];
            i += 1;
            let target = path.join(relative);
            tree.apply_user_overwrite(&target, node, node.clone(), write_id, true, false)
                .unwrap();
            let events = tree.ack_user_write(write_id, false, false, &clock).unwrap();
            write_id = write_id.next();
            black_box(events);
        });
    });
}

/// Benchmark event cache reads through a stack of pending writes.
fn bench_complete_event_cache(c: &mut Criterion) {
    let mut tree = tree();
    for (i, (path, node)) in random_writes(200, 3, 6).into_iter().enumerate() {
        tree.apply_user_overwrite(&path, &node, node.clone(), WriteId::new(i as u64 + 1), true, false)
            .unwrap();
    }
    let root = Path::empty();

    c.bench_function("calc_complete_event_cache", |b| {
        b.iter(|| {
            let node = tree.calc_complete_event_cache(black_box(&root), &[]);
            black_box(node);
        });
    });
}

criterion_group!(
    benches,
    bench_server_overwrite,
    bench_limited_query,
    bench_write_and_ack,
    bench_complete_event_cache,
);

criterion_main!(benches);
