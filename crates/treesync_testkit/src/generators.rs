//! Property-based test generators using proptest.
//!
//! Keys are drawn from a small alphabet so that generated paths collide
//! often and overlapping writes are common.

use proptest::prelude::*;
use treesync_core::{ChildKey, CompoundWrite, Node, Path};

/// Strategy for child keys: a few letters and a few integer-like keys.
pub fn key_strategy() -> impl Strategy<Value = ChildKey> {
    prop_oneof![
        prop::sample::select(vec!["a", "b", "c", "d"]),
        prop::sample::select(vec!["0", "1", "2"]),
    ]
    .prop_map(ChildKey::new)
}

/// Strategy for paths of at most `max_depth` keys, the root included.
pub fn path_strategy(max_depth: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(key_strategy(), 0..=max_depth).prop_map(Path::from_keys)
}

/// Strategy for paths of one to `max_depth` keys.
pub fn non_empty_path_strategy(max_depth: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(key_strategy(), 1..=max_depth.max(1)).prop_map(Path::from_keys)
}

/// Strategy for leaf values.
pub fn leaf_strategy() -> impl Strategy<Value = Node> {
    prop_oneof![
        any::<bool>().prop_map(Node::from),
        (-50_i64..50).prop_map(Node::from),
        "[a-z]{1,4}".prop_map(|s| Node::from(s.as_str())),
    ]
}

/// Strategy for small trees, the empty node included.
pub fn node_strategy() -> impl Strategy<Value = Node> {
    let leaf = prop_oneof![
        1 => Just(Node::empty()),
        6 => leaf_strategy(),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map(key_strategy(), inner, 0..4).prop_map(Node::from_children)
    })
}

/// Strategy for compound writes built from up to `max_entries` writes.
pub fn compound_write_strategy(max_entries: usize) -> impl Strategy<Value = CompoundWrite> {
    prop::collection::vec((path_strategy(3), node_strategy()), 0..=max_entries)
        .prop_map(CompoundWrite::from_path_merge)
}

/// One step of a sync tree scenario.
#[derive(Debug, Clone)]
pub enum TreeOperation {
    /// A local overwrite.
    UserSet {
        /// Written location.
        path: Path,
        /// Written value.
        node: Node,
    },
    /// Acknowledges the oldest pending write, if any.
    AckOldest,
    /// Server data for a location.
    ServerSet {
        /// Updated location.
        path: Path,
        /// New value.
        node: Node,
    },
}

impl TreeOperation {
    /// True for operations that originate locally.
    pub fn is_user(&self) -> bool {
        !matches!(self, Self::ServerSet { .. })
    }
}

/// Strategy for a single scenario step.
pub fn tree_operation_strategy() -> impl Strategy<Value = TreeOperation> {
    prop_oneof![
        3 => (path_strategy(2), node_strategy())
            .prop_map(|(path, node)| TreeOperation::UserSet { path, node }),
        1 => Just(TreeOperation::AckOldest),
        3 => (path_strategy(2), node_strategy())
            .prop_map(|(path, node)| TreeOperation::ServerSet { path, node }),
    ]
}

/// Strategy for a sequence of scenario steps.
pub fn tree_operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TreeOperation>> {
    prop::collection::vec(tree_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
