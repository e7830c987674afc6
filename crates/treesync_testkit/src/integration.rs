//! Cross-crate integration helpers.
//!
//! Replays generated operation sequences against a full sync tree so that
//! properties about ordering can be checked end to end.

use std::collections::VecDeque;

use serde_json::Value;
use treesync_core::{Node, Path, QuerySpec, WriteId};

use crate::fixtures::{RecordingListener, TestTree};
use crate::generators::TreeOperation;

/// What a replay left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// The value at the root as listeners would see it.
    pub effective: Option<Node>,
    /// The last value delivered to a root listener.
    pub last_value_event: Option<Value>,
    /// Writes still pending at the end.
    pub pending: usize,
}

/// Applies `operations` to a fresh tree that listens at the root and starts
/// from an empty, complete server value.
pub fn replay(operations: &[TreeOperation]) -> ReplayOutcome {
    let mut tree = TestTree::memory();
    let listener = RecordingListener::new();
    tree.listen_value(QuerySpec::default_at(Path::empty()), &listener);
    let events = tree
        .tree
        .apply_server_overwrite(&Path::empty(), Node::empty())
        .expect("Failed to seed server data");
    tree.raise(events);

    let mut pending = VecDeque::new();
    let mut next_write_id = WriteId::new(1);
    for operation in operations {
        let events = match operation {
            TreeOperation::UserSet { path, node } => {
                let write_id = next_write_id;
                next_write_id = write_id.next();
                pending.push_back(write_id);
                tree.tree
                    .apply_user_overwrite(path, node, node.clone(), write_id, true, false)
                    .expect("Failed to apply user overwrite")
            }
            TreeOperation::AckOldest => match pending.pop_front() {
                Some(write_id) => tree
                    .tree
                    .ack_user_write(write_id, false, false, &*tree.clock)
                    .expect("Failed to ack write"),
                None => Vec::new(),
            },
            TreeOperation::ServerSet { path, node } => tree
                .tree
                .apply_server_overwrite(path, node.clone())
                .expect("Failed to apply server overwrite"),
        };
        tree.raise(events);
    }

    ReplayOutcome {
        effective: tree.tree.calc_complete_event_cache(&Path::empty(), &[]),
        last_value_event: listener.last_value(),
        pending: pending.len(),
    }
}

/// Reorders `operations` while keeping local operations in their relative
/// order and server operations in theirs. Each entry of `user_first` picks
/// the next local (`true`) or server (`false`) operation; leftovers follow.
pub fn interleave(operations: &[TreeOperation], user_first: &[bool]) -> Vec<TreeOperation> {
    let (mut user, mut server): (VecDeque<_>, VecDeque<_>) =
        operations.iter().cloned().partition(TreeOperation::is_user);
    let mut out = Vec::with_capacity(operations.len());
    for &pick_user in user_first {
        let next = if pick_user {
            user.pop_front().or_else(|| server.pop_front())
        } else {
            server.pop_front().or_else(|| user.pop_front())
        };
        match next {
            Some(operation) => out.push(operation),
            None => break,
        }
    }
    out.extend(user);
    out.extend(server);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{tree_operation_sequence_strategy, PropTestConfig};
    use proptest::prelude::*;
    use serde_json::json;

    fn set(path: &str, value: Value, server: bool) -> TreeOperation {
        let path = Path::parse(path).unwrap();
        let node = Node::from_json(&value).unwrap();
        if server {
            TreeOperation::ServerSet { path, node }
        } else {
            TreeOperation::UserSet { path, node }
        }
    }

    #[test]
    fn pending_write_shadows_server_data() {
        let outcome = replay(&[
            set("a", json!({"foo": 1}), false),
            set("a", json!({"foo": 2, "bar": 2}), true),
        ]);
        assert_eq!(outcome.effective.unwrap().to_json(), json!({"a": {"foo": 1}}));
        assert_eq!(outcome.pending, 1);
    }

    #[test]
    fn acked_write_gives_way_to_server_data() {
        let outcome = replay(&[
            set("a/foo", json!(1), false),
            set("a", json!({"foo": 1, "bar": 2}), true),
            TreeOperation::AckOldest,
        ]);
        assert_eq!(
            outcome.effective.unwrap().to_json(),
            json!({"a": {"foo": 1, "bar": 2}})
        );
        assert_eq!(outcome.last_value_event, Some(json!({"a": {"foo": 1, "bar": 2}})));
        assert_eq!(outcome.pending, 0);
    }

    #[test]
    fn interleave_keeps_category_order() {
        let ops = vec![
            set("a", json!(1), false),
            set("b", json!(2), true),
            set("c", json!(3), false),
        ];
        let reordered = interleave(&ops, &[false, true]);
        let kinds: Vec<bool> = reordered.iter().map(TreeOperation::is_user).collect();
        assert_eq!(kinds, vec![false, true, true]);
        match &reordered[2] {
            TreeOperation::UserSet { path, .. } => assert_eq!(path.to_string(), "/c"),
            other => panic!("unexpected {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn replay_is_independent_of_interleaving(
            ops in tree_operation_sequence_strategy(0, 12),
            mask in prop::collection::vec(any::<bool>(), 0..24),
        ) {
            let straight = replay(&ops);
            let shuffled = replay(&interleave(&ops, &mask));
            prop_assert_eq!(&straight.effective, &shuffled.effective);
            prop_assert_eq!(straight.pending, shuffled.pending);
        }

        #[test]
        fn listeners_see_the_effective_value(ops in tree_operation_sequence_strategy(0, 12)) {
            let outcome = replay(&ops);
            let effective = outcome.effective.map(|node| node.to_json());
            prop_assert_eq!(outcome.last_value_event, effective);
        }
    }
}
