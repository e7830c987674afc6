//! Cached snapshots with completeness flags.

use crate::indexed_node::IndexedNode;
use crate::key::ChildKey;
use crate::node::Node;
use crate::path::Path;

/// A cached node plus what is known about its completeness.
///
/// `fully_initialized == false` means the node may be missing data and must
/// not be treated as authoritative. `filtered == true` means only the part
/// of the data matched by a query was kept.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
    indexed_node: IndexedNode,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    /// Wraps a snapshot.
    pub fn new(indexed_node: IndexedNode, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            indexed_node,
            fully_initialized,
            filtered,
        }
    }

    /// The snapshot with its ordering.
    #[must_use]
    pub fn indexed_node(&self) -> &IndexedNode {
        &self.indexed_node
    }

    /// The snapshot.
    #[must_use]
    pub fn node(&self) -> &Node {
        self.indexed_node.node()
    }

    /// True if the snapshot holds all data at its location (subject to
    /// filtering).
    #[must_use]
    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    /// True if a query filter dropped some children.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// True if the value at `path` is known.
    #[must_use]
    pub fn is_complete_for_path(&self, path: &Path) -> bool {
        match path.front() {
            None => self.fully_initialized && !self.filtered,
            Some(key) => self.is_complete_for_child(key),
        }
    }

    /// True if the value of the child `key` is known.
    #[must_use]
    pub fn is_complete_for_child(&self, key: &ChildKey) -> bool {
        (self.fully_initialized && !self.filtered) || self.node().has_child(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completeness() {
        let node = Node::from_json(&json!({"a": 1})).unwrap();
        let partial = CacheNode::new(IndexedNode::from_node(node.clone()), false, false);
        assert!(partial.is_complete_for_child(&ChildKey::new("a")));
        assert!(!partial.is_complete_for_child(&ChildKey::new("b")));
        assert!(!partial.is_complete_for_path(&Path::empty()));

        let filtered = CacheNode::new(IndexedNode::from_node(node.clone()), true, true);
        assert!(!filtered.is_complete_for_path(&Path::empty()));
        assert!(!filtered.is_complete_for_child(&ChildKey::new("b")));

        let complete = CacheNode::new(IndexedNode::from_node(node), true, false);
        assert!(complete.is_complete_for_child(&ChildKey::new("b")));
    }
}
