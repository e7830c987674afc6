//! Immutable tree values.
//!
//! A [`Node`] is either empty, a leaf scalar, or an ordered map from
//! [`ChildKey`] to child nodes. Any non-empty node can carry a [`Priority`]
//! used to order it among its siblings. Every update returns a new node and
//! shares untouched subtrees with the original.

mod hash;
mod json;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::key::ChildKey;
use crate::path::Path;

/// A JSON number with total ordering and hashing.
///
/// `-0.0` is normalized to `0.0` so that equal values hash equally.
#[derive(Debug, Clone, Copy)]
pub struct Number(f64);

impl Number {
    /// Wraps a finite float.
    #[must_use]
    pub fn new(value: f64) -> Self {
        if value == 0.0 {
            Self(0.0)
        } else {
            Self(value)
        }
    }

    /// Returns the float value.
    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }

    /// Returns the value as an integer when it has no fractional part and
    /// fits in the safe integer range.
    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
        if self.0.fract() == 0.0 && self.0.abs() <= MAX_SAFE {
            Some(self.0 as i64)
        } else {
            None
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Number {}

impl std::hash::Hash for Number {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_i64() {
            Some(int) => write!(f, "{int}"),
            None => write!(f, "{}", self.0),
        }
    }
}

/// The scalar stored in a leaf node.
///
/// The derived ordering (booleans, then numbers, then strings) is the
/// ordering used by value queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeafValue {
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(Number),
    /// A string.
    String(Arc<str>),
}

impl fmt::Display for LeafValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Sort metadata attached to a node.
///
/// Nodes without a priority sort first, then numeric priorities, then
/// string priorities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    /// No priority.
    #[default]
    None,
    /// A numeric priority.
    Number(Number),
    /// A string priority.
    String(Arc<str>),
}

impl Priority {
    /// Returns true when no priority is set.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Reads a priority from a node value. Anything other than a number or
    /// string leaf clears the priority.
    #[must_use]
    pub fn from_node(node: &Node) -> Self {
        match node.leaf_value() {
            Some(LeafValue::Number(n)) => Self::Number(*n),
            Some(LeafValue::String(s)) => Self::String(Arc::clone(s)),
            _ => Self::None,
        }
    }

    /// The priority as a leaf node, or the empty node.
    #[must_use]
    pub fn to_node(&self) -> Node {
        match self {
            Self::None => Node::empty(),
            Self::Number(n) => Node::leaf(LeafValue::Number(*n)),
            Self::String(s) => Node::leaf(LeafValue::String(Arc::clone(s))),
        }
    }
}

#[derive(PartialEq, Eq, Hash)]
enum Repr {
    Leaf {
        value: LeafValue,
        priority: Priority,
    },
    Children {
        children: BTreeMap<ChildKey, Node>,
        priority: Priority,
    },
}

/// An immutable tree value.
#[derive(Clone)]
pub struct Node(Arc<Repr>);

static EMPTY: OnceLock<Node> = OnceLock::new();

impl Node {
    /// The empty node. It has no children and never carries a priority.
    pub fn empty() -> Self {
        EMPTY
            .get_or_init(|| {
                Node(Arc::new(Repr::Children {
                    children: BTreeMap::new(),
                    priority: Priority::None,
                }))
            })
            .clone()
    }

    /// A leaf holding a scalar.
    pub fn leaf(value: LeafValue) -> Self {
        Node(Arc::new(Repr::Leaf {
            value,
            priority: Priority::None,
        }))
    }

    /// A node with the given children. Empty children are dropped.
    pub fn from_children(children: impl IntoIterator<Item = (ChildKey, Node)>) -> Self {
        let children: BTreeMap<ChildKey, Node> = children
            .into_iter()
            .filter(|(key, node)| !node.is_empty() && !key.is_priority())
            .collect();
        Self::children_node(children, Priority::None)
    }

    fn children_node(children: BTreeMap<ChildKey, Node>, priority: Priority) -> Self {
        if children.is_empty() {
            Self::empty()
        } else {
            Node(Arc::new(Repr::Children { children, priority }))
        }
    }

    /// True for the empty node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(&*self.0, Repr::Children { children, .. } if children.is_empty())
    }

    /// True for scalar nodes.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(&*self.0, Repr::Leaf { .. })
    }

    /// The scalar value of a leaf.
    #[must_use]
    pub fn leaf_value(&self) -> Option<&LeafValue> {
        match &*self.0 {
            Repr::Leaf { value, .. } => Some(value),
            Repr::Children { .. } => None,
        }
    }

    /// The node's priority.
    #[must_use]
    pub fn priority(&self) -> &Priority {
        match &*self.0 {
            Repr::Leaf { priority, .. } | Repr::Children { priority, .. } => priority,
        }
    }

    /// Returns a copy with the priority replaced. The empty node ignores
    /// priorities.
    #[must_use]
    pub fn with_priority(&self, priority: Priority) -> Self {
        if self.priority() == &priority {
            return self.clone();
        }
        match &*self.0 {
            Repr::Leaf { value, .. } => Node(Arc::new(Repr::Leaf {
                value: value.clone(),
                priority,
            })),
            Repr::Children { children, .. } if !children.is_empty() => {
                Node(Arc::new(Repr::Children {
                    children: children.clone(),
                    priority,
                }))
            }
            Repr::Children { .. } => self.clone(),
        }
    }

    /// Number of children. Leaves have none.
    #[must_use]
    pub fn child_count(&self) -> usize {
        match &*self.0 {
            Repr::Children { children, .. } => children.len(),
            Repr::Leaf { .. } => 0,
        }
    }

    /// Iterates children in key order.
    pub fn children(&self) -> impl DoubleEndedIterator<Item = (&ChildKey, &Node)> {
        let map = match &*self.0 {
            Repr::Children { children, .. } => Some(children),
            Repr::Leaf { .. } => None,
        };
        map.into_iter().flat_map(|m| m.iter())
    }

    /// True if a non-empty child exists under `key`.
    #[must_use]
    pub fn has_child(&self, key: &ChildKey) -> bool {
        !self.immediate_child(key).is_empty()
    }

    /// The child under `key`, or the empty node. `.priority` yields the
    /// priority as a leaf.
    #[must_use]
    pub fn immediate_child(&self, key: &ChildKey) -> Node {
        if key.is_priority() {
            return self.priority().to_node();
        }
        match &*self.0 {
            Repr::Children { children, .. } => {
                children.get(key).cloned().unwrap_or_else(Node::empty)
            }
            Repr::Leaf { .. } => Node::empty(),
        }
    }

    /// The descendant at `path`, or the empty node.
    #[must_use]
    pub fn child(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for key in path {
            if current.is_empty() {
                break;
            }
            current = current.immediate_child(key);
        }
        current
    }

    /// Replaces one child. Writing `.priority` updates the priority; writing
    /// the empty node removes the child.
    #[must_use]
    pub fn update_immediate_child(&self, key: &ChildKey, child: Node) -> Self {
        if key.is_priority() {
            return self.with_priority(Priority::from_node(&child));
        }
        match &*self.0 {
            Repr::Leaf { priority, .. } => {
                if child.is_empty() {
                    self.clone()
                } else {
                    let mut children = BTreeMap::new();
                    children.insert(key.clone(), child);
                    Self::children_node(children, priority.clone())
                }
            }
            Repr::Children { children, priority } => {
                let existing = children.get(key);
                if child.is_empty() && existing.is_none() {
                    return self.clone();
                }
                if existing == Some(&child) {
                    return self.clone();
                }
                let mut children = children.clone();
                if child.is_empty() {
                    children.remove(key);
                } else {
                    children.insert(key.clone(), child);
                }
                Self::children_node(children, priority.clone())
            }
        }
    }

    /// Replaces the descendant at `path`.
    ///
    /// # Panics
    ///
    /// Panics if `.priority` appears anywhere but the last position.
    #[must_use]
    pub fn update_child(&self, path: &Path, node: Node) -> Self {
        let Some(front) = path.front() else {
            return node;
        };
        if front.is_priority() {
            assert!(path.len() == 1, "can't update a priority with additional path components");
            return self.update_immediate_child(front, node);
        }
        if self.is_leaf() && node.is_empty() {
            return self.clone();
        }
        let child = self.immediate_child(front).update_child(&path.pop_front(), node);
        self.update_immediate_child(front, child)
    }

    /// Orders nodes the way value queries do: empty, then leaves (booleans,
    /// numbers, strings), then nodes with children, which all compare equal.
    #[must_use]
    pub fn compare_to(&self, other: &Node) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        match (self.leaf_value(), other.leaf_value()) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.to_export_json())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::leaf(LeafValue::Bool(value))
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::leaf(LeafValue::Number(Number::new(value)))
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::from(value as f64)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::leaf(LeafValue::String(Arc::from(value)))
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::leaf(LeafValue::String(Arc::from(value)))
    }
}
