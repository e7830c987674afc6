//! Child orderings used by queries.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::key::ChildKey;
use crate::node::{Node, Priority};
use crate::path::Path;

/// A child paired with its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedNode {
    name: ChildKey,
    node: Node,
}

impl NamedNode {
    /// Pairs a key with a node.
    pub fn new(name: ChildKey, node: Node) -> Self {
        Self { name, node }
    }

    /// The child's key.
    #[must_use]
    pub fn name(&self) -> &ChildKey {
        &self.name
    }

    /// The child's value.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Splits into key and node.
    #[must_use]
    pub fn into_parts(self) -> (ChildKey, Node) {
        (self.name, self.node)
    }
}

/// The ordering a query applies to the children of its location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Index {
    /// Order by priority, then key. The default.
    #[default]
    Priority,
    /// Order by key.
    Key,
    /// Order by the child's own value, then key.
    Value,
    /// Order by the value found at a path inside each child, then key.
    Path(Path),
}

const PRIORITY_POST: &str = "[PRIORITY-POST]";

impl Index {
    /// Compares two children under this ordering. Ties always fall back to
    /// key order, so distinct keys never compare equal.
    #[must_use]
    pub fn compare(&self, a: &NamedNode, b: &NamedNode) -> Ordering {
        let by_index = match self {
            Self::Priority => a.node.priority().cmp(b.node.priority()),
            Self::Key => Ordering::Equal,
            Self::Value => a.node.compare_to(&b.node),
            Self::Path(path) => a.node.child(path).compare_to(&b.node.child(path)),
        };
        by_index.then_with(|| a.name.cmp(&b.name))
    }

    /// Like [`Index::compare`], flipped when `reverse` is set.
    #[must_use]
    pub fn compare_directional(&self, a: &NamedNode, b: &NamedNode, reverse: bool) -> Ordering {
        if reverse {
            self.compare(b, a)
        } else {
            self.compare(a, b)
        }
    }

    /// True if the node has a value this index can sort by.
    #[must_use]
    pub fn is_defined_on(&self, node: &Node) -> bool {
        match self {
            Self::Priority => !node.priority().is_none(),
            Self::Key | Self::Value => true,
            Self::Path(path) => !node.child(path).is_empty(),
        }
    }

    /// True if replacing `old` with `new` can move the child to a new
    /// position.
    #[must_use]
    pub fn indexed_value_changed(&self, old: &Node, new: &Node) -> bool {
        match self {
            Self::Priority => old.priority() != new.priority(),
            Self::Key => false,
            Self::Value | Self::Path(_) => {
                let old = NamedNode::new(ChildKey::min(), old.clone());
                let new = NamedNode::new(ChildKey::min(), new.clone());
                self.compare(&old, &new) != Ordering::Equal
            }
        }
    }

    /// Builds the boundary child a range query compares against.
    #[must_use]
    pub fn make_post(&self, name: ChildKey, value: &Node) -> NamedNode {
        match self {
            Self::Priority => NamedNode::new(
                name,
                Node::from(PRIORITY_POST).with_priority(Priority::from_node(value)),
            ),
            Self::Key => {
                let key = value
                    .leaf_value()
                    .map_or_else(|| name.clone(), |leaf| ChildKey::new(&leaf.to_string()));
                NamedNode::new(key, Node::empty())
            }
            Self::Value => NamedNode::new(name, value.clone()),
            Self::Path(path) => NamedNode::new(name, Node::empty().update_child(path, value.clone())),
        }
    }

    /// The wire name of the index.
    #[must_use]
    pub fn query_definition(&self) -> String {
        match self {
            Self::Priority => ".priority".to_string(),
            Self::Key => ".key".to_string(),
            Self::Value => ".value".to_string(),
            Self::Path(path) => path.iter().map(ChildKey::as_str).collect::<Vec<_>>().join("/"),
        }
    }

    /// Parses a wire name produced by [`Index::query_definition`].
    ///
    /// # Errors
    ///
    /// Returns an error for an empty child path.
    pub fn from_query_definition(definition: &str) -> CoreResult<Self> {
        match definition {
            ".priority" => Ok(Self::Priority),
            ".key" => Ok(Self::Key),
            ".value" => Ok(Self::Value),
            other => {
                let path = Path::parse(other)?;
                if path.is_empty() {
                    return Err(CoreError::invalid_query("child index needs a non-empty path"));
                }
                Ok(Self::Path(path))
            }
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query_definition())
    }
}
