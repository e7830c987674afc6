//! A node together with the order of its children under one index.

use std::sync::Arc;

use crate::index::{Index, NamedNode};
use crate::key::ChildKey;
use crate::node::{Node, Priority};

/// A node plus the ordering of its children under an [`Index`].
///
/// Key order is the node's natural order, so no side table is built for
/// [`Index::Key`]. Other indexes keep a sorted list that is patched on
/// single-child updates.
#[derive(Debug, Clone)]
pub struct IndexedNode {
    node: Node,
    index: Index,
    ordered: Option<Arc<Vec<NamedNode>>>,
}

impl IndexedNode {
    /// Indexes `node` under `index`.
    pub fn new(node: Node, index: Index) -> Self {
        let ordered = if index == Index::Key || node.child_count() == 0 {
            None
        } else {
            let mut children: Vec<NamedNode> = node
                .children()
                .map(|(key, child)| NamedNode::new(key.clone(), child.clone()))
                .collect();
            children.sort_by(|a, b| index.compare(a, b));
            Some(Arc::new(children))
        };
        Self {
            node,
            index,
            ordered,
        }
    }

    /// Indexes `node` under the default priority index.
    pub fn from_node(node: Node) -> Self {
        Self::new(node, Index::Priority)
    }

    /// The underlying node.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The index used for ordering.
    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// True if this node is ordered by `index`.
    #[must_use]
    pub fn has_index(&self, index: &Index) -> bool {
        &self.index == index
    }

    /// Children in index order.
    pub fn iter(&self) -> Box<dyn DoubleEndedIterator<Item = NamedNode> + '_> {
        match &self.ordered {
            Some(ordered) => Box::new(ordered.iter().cloned()),
            None => Box::new(
                self.node
                    .children()
                    .map(|(key, child)| NamedNode::new(key.clone(), child.clone())),
            ),
        }
    }

    /// Children in reverse index order.
    pub fn iter_rev(&self) -> Box<dyn Iterator<Item = NamedNode> + '_> {
        Box::new(self.iter().rev())
    }

    /// The first child in index order.
    #[must_use]
    pub fn first_child(&self) -> Option<NamedNode> {
        self.iter().next()
    }

    /// The last child in index order.
    #[must_use]
    pub fn last_child(&self) -> Option<NamedNode> {
        self.iter().next_back()
    }

    /// Replaces one child, keeping the ordering current.
    #[must_use]
    pub fn update_child(&self, key: &ChildKey, child: Node) -> Self {
        let node = self.node.update_immediate_child(key, child.clone());
        if node == self.node {
            return self.clone();
        }
        let ordered = match &self.ordered {
            None => {
                return Self::new(node, self.index.clone());
            }
            Some(ordered) => {
                let mut ordered: Vec<NamedNode> = ordered
                    .iter()
                    .filter(|entry| entry.name() != key)
                    .cloned()
                    .collect();
                if !child.is_empty() && !key.is_priority() {
                    let entry = NamedNode::new(key.clone(), child);
                    let position = ordered
                        .binary_search_by(|probe| self.index.compare(probe, &entry))
                        .unwrap_or_else(|insert_at| insert_at);
                    ordered.insert(position, entry);
                }
                ordered
            }
        };
        Self {
            node,
            index: self.index.clone(),
            ordered: if ordered.is_empty() {
                None
            } else {
                Some(Arc::new(ordered))
            },
        }
    }

    /// Replaces the node's own priority. Child order is unaffected.
    #[must_use]
    pub fn update_priority(&self, priority: Priority) -> Self {
        Self {
            node: self.node.with_priority(priority),
            index: self.index.clone(),
            ordered: self.ordered.clone(),
        }
    }

    /// The key of the child ordered just before `key` (whose value is
    /// `child`), if any.
    #[must_use]
    pub fn predecessor_child_name(&self, key: &ChildKey, child: &Node) -> Option<ChildKey> {
        let target = NamedNode::new(key.clone(), child.clone());
        let mut previous = None;
        for entry in self.iter() {
            if self.index.compare(&entry, &target) != std::cmp::Ordering::Less {
                break;
            }
            previous = Some(entry.name().clone());
        }
        previous
    }
}

impl PartialEq for IndexedNode {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.index == other.index
    }
}

impl Eq for IndexedNode {}

impl From<Node> for IndexedNode {
    fn from(node: Node) -> Self {
        Self::from_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn indexed(value: serde_json::Value, index: Index) -> IndexedNode {
        IndexedNode::new(Node::from_json(&value).unwrap(), index)
    }

    fn names(node: &IndexedNode) -> Vec<String> {
        node.iter().map(|n| n.name().as_str().to_string()).collect()
    }

    #[test]
    fn orders_by_value() {
        let node = indexed(json!({"a": 3, "b": 1, "c": 2}), Index::Value);
        assert_eq!(names(&node), vec!["b", "c", "a"]);
        assert_eq!(node.first_child().unwrap().name().as_str(), "b");
        assert_eq!(node.last_child().unwrap().name().as_str(), "a");
    }

    #[test]
    fn update_keeps_order() {
        let node = indexed(json!({"a": 3, "b": 1, "c": 2}), Index::Value);
        let node = node.update_child(&ChildKey::new("b"), Node::from(10_i64));
        assert_eq!(names(&node), vec!["c", "a", "b"]);
        let node = node.update_child(&ChildKey::new("c"), Node::empty());
        assert_eq!(names(&node), vec!["a", "b"]);
        assert_eq!(node, indexed(json!({"a": 3, "b": 10}), Index::Value));
    }

    #[test]
    fn key_index_uses_natural_order() {
        let node = indexed(json!({"b": 1, "a": 2, "10": 0}), Index::Key);
        assert_eq!(names(&node), vec!["10", "a", "b"]);
        let node = node.update_child(&ChildKey::new("c"), Node::from(true));
        assert_eq!(names(&node), vec!["10", "a", "b", "c"]);
    }

    #[test]
    fn predecessor_names() {
        let node = indexed(json!({"a": 3, "b": 1, "c": 2}), Index::Value);
        let a = node.node().immediate_child(&ChildKey::new("a"));
        assert_eq!(
            node.predecessor_child_name(&ChildKey::new("a"), &a),
            Some(ChildKey::new("c"))
        );
        let b = node.node().immediate_child(&ChildKey::new("b"));
        assert_eq!(node.predecessor_child_name(&ChildKey::new("b"), &b), None);
    }

    #[test]
    fn reverse_iteration() {
        let node = indexed(json!({"a": 3, "b": 1, "c": 2}), Index::Value);
        let rev: Vec<String> = node.iter_rev().map(|n| n.name().as_str().to_string()).collect();
        assert_eq!(rev, vec!["a", "c", "b"]);
    }
}
