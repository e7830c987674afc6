//! Sparse overlays of pending writes.

use std::collections::BTreeMap;

use crate::immutable_tree::ImmutableTree;
use crate::index::NamedNode;
use crate::key::ChildKey;
use crate::node::Node;
use crate::path::Path;

/// A set of whole-subtree overwrites keyed by relative path.
///
/// No entry is ever stored below another entry: writing at a path absorbs
/// any deeper entries, and writing below an existing entry updates that
/// entry's node instead of adding a second one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompoundWrite {
    tree: ImmutableTree<Node>,
}

impl CompoundWrite {
    /// A write with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a write from `(relative path, node)` pairs, applied in order.
    pub fn from_path_merge(entries: impl IntoIterator<Item = (Path, Node)>) -> Self {
        entries
            .into_iter()
            .fold(Self::empty(), |write, (path, node)| write.add_write(&path, node))
    }

    /// Builds a write from a multi-location update.
    ///
    /// # Panics
    ///
    /// Panics if one path equals or contains another.
    pub fn from_disjoint_merge(mut entries: Vec<(Path, Node)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in entries.windows(2) {
            assert!(
                !pair[0].0.contains(&pair[1].0),
                "path {} is an ancestor of {} in the same update",
                pair[0].0,
                pair[1].0
            );
        }
        Self::from_path_merge(entries)
    }

    /// Builds a write that replaces the given immediate children.
    pub fn from_child_merge(entries: impl IntoIterator<Item = (ChildKey, Node)>) -> Self {
        Self::from_path_merge(entries.into_iter().map(|(key, node)| (Path::from_key(key), node)))
    }

    /// Overwrites everything at and below `path`.
    ///
    /// If an existing entry sits above `path`, the new value is folded into
    /// that entry. A priority written onto a location that holds no value
    /// is dropped.
    #[must_use]
    pub fn add_write(&self, path: &Path, node: Node) -> Self {
        if path.is_empty() {
            return Self {
                tree: ImmutableTree::leaf(node),
            };
        }
        match self.tree.find_root_most_path_with_value(path) {
            Some(root_most) => {
                let relative = Path::relative(&root_most, path);
                let Some(existing) = self.tree.get(&root_most) else {
                    return self.clone();
                };
                let priority_on_empty = relative.back().is_some_and(ChildKey::is_priority)
                    && relative
                        .parent()
                        .is_some_and(|parent| existing.child(&parent).is_empty());
                if priority_on_empty {
                    return self.clone();
                }
                let updated = existing.update_child(&relative, node);
                Self {
                    tree: self.tree.set(&root_most, updated),
                }
            }
            None => Self {
                tree: self.tree.set_tree(path, ImmutableTree::leaf(node)),
            },
        }
    }

    /// Adds every entry of `updates`, rebased under `path`.
    #[must_use]
    pub fn add_writes(&self, path: &Path, updates: &CompoundWrite) -> Self {
        updates
            .tree
            .fold(self.clone(), |relative, node, write| {
                write.add_write(&path.join(relative), node.clone())
            })
    }

    /// Removes the entry exactly at `path`, along with anything below it.
    /// Entries above `path` are untouched.
    #[must_use]
    pub fn remove_write(&self, path: &Path) -> Self {
        if path.is_empty() {
            return Self::empty();
        }
        Self {
            tree: self.tree.set_tree(path, ImmutableTree::empty()),
        }
    }

    /// True if some entry at or above `path` determines its value.
    #[must_use]
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.complete_node(path).is_some()
    }

    /// The entry at the root, if the write replaces everything.
    #[must_use]
    pub fn root_write(&self) -> Option<&Node> {
        self.tree.value()
    }

    /// The value at `path` if an entry at or above it determines it.
    #[must_use]
    pub fn complete_node(&self, path: &Path) -> Option<Node> {
        let root_most = self.tree.find_root_most_path_with_value(path)?;
        let node = self.tree.get(&root_most)?;
        Some(node.child(&Path::relative(&root_most, path)))
    }

    /// Immediate children whose values are fully determined by this write.
    #[must_use]
    pub fn complete_children(&self) -> Vec<NamedNode> {
        match self.tree.value() {
            Some(root) => root
                .children()
                .map(|(key, child)| NamedNode::new(key.clone(), child.clone()))
                .collect(),
            None => self
                .tree
                .children()
                .filter_map(|(key, child)| {
                    child.value().map(|node| NamedNode::new(key.clone(), node.clone()))
                })
                .collect(),
        }
    }

    /// The part of this write that applies at `path`, rebased there.
    #[must_use]
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        match self.complete_node(path) {
            Some(shadowing) => Self {
                tree: ImmutableTree::leaf(shadowing),
            },
            None => Self {
                tree: self.tree.subtree(path),
            },
        }
    }

    /// The rebased write for each immediate child that has entries.
    #[must_use]
    pub fn child_compound_writes(&self) -> BTreeMap<ChildKey, CompoundWrite> {
        self.tree
            .children()
            .map(|(key, child)| (key.clone(), Self { tree: child.clone() }))
            .collect()
    }

    /// True if the write has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Every entry, parents before children and siblings in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Path, Node)> {
        self.tree.entries()
    }

    /// Applies every entry onto `node`. Priority entries are applied after
    /// their siblings, and only when the location ends up non-empty.
    #[must_use]
    pub fn apply(&self, node: &Node) -> Node {
        apply_subtree(&Path::empty(), &self.tree, node.clone())
    }
}

fn apply_subtree(at: &Path, tree: &ImmutableTree<Node>, mut node: Node) -> Node {
    if let Some(value) = tree.value() {
        return node.update_child(at, value.clone());
    }
    let mut priority_write = None;
    for (key, child) in tree.children() {
        if key.is_priority() {
            priority_write = child.value().cloned();
        } else {
            node = apply_subtree(&at.child(key), child, node);
        }
    }
    if let Some(priority) = priority_write {
        if !node.child(at).is_empty() {
            node = node.update_child(&at.child(&ChildKey::priority()), priority);
        }
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Priority;
    use serde_json::json;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn n(value: serde_json::Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    #[test]
    fn shallower_write_discards_deeper() {
        let write = CompoundWrite::empty()
            .add_write(&p("foo/bar"), n(json!("X")))
            .add_write(&p("foo"), n(json!({"bar": "Y", "baz": "Z"})));
        assert_eq!(write.entries().len(), 1);
        assert_eq!(
            write.apply(&Node::empty()).to_json(),
            json!({"foo": {"bar": "Y", "baz": "Z"}})
        );
    }

    #[test]
    fn deeper_write_updates_existing_entry() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!({"b": 1})))
            .add_write(&p("a/c"), n(json!(2)));
        assert_eq!(write.entries(), vec![(p("a"), n(json!({"b": 1, "c": 2})))]);
    }

    #[test]
    fn apply_leaves_unwritten_data_alone() {
        let base = n(json!({"a": 1, "b": {"c": 2, "d": 3}}));
        let write = CompoundWrite::empty().add_write(&p("b/c"), n(json!(20)));
        assert_eq!(
            write.apply(&base).to_json(),
            json!({"a": 1, "b": {"c": 20, "d": 3}})
        );
    }

    #[test]
    fn priority_on_missing_node_is_ignored() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!({"x": 1})))
            .add_write(&p("a/missing/.priority"), n(json!(5)));
        assert_eq!(write.complete_node(&p("a")), Some(n(json!({"x": 1}))));

        let deferred = CompoundWrite::empty().add_write(&p("q/.priority"), n(json!(5)));
        assert!(deferred.apply(&Node::empty()).is_empty());
        let applied = deferred.apply(&n(json!({"q": "v"})));
        assert_eq!(
            applied.child(&p("q")).priority(),
            &Priority::Number(crate::node::Number::new(5.0))
        );
    }

    #[test]
    fn remove_write_is_exact() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!(1)))
            .add_write(&p("b/c"), n(json!(2)));
        let removed = write.remove_write(&p("b/c"));
        assert_eq!(removed.entries(), vec![(p("a"), n(json!(1)))]);
        assert_eq!(write.remove_write(&p("zz")), write);
        assert!(write.remove_write(&Path::empty()).is_empty());
    }

    #[test]
    fn complete_writes() {
        let write = CompoundWrite::empty().add_write(&p("a/b"), n(json!({"c": 1})));
        assert!(write.has_complete_write(&p("a/b")));
        assert!(write.has_complete_write(&p("a/b/c/d")));
        assert!(!write.has_complete_write(&p("a")));
        assert_eq!(write.complete_node(&p("a/b/c")), Some(n(json!(1))));
        assert_eq!(write.complete_node(&p("a/b/zz")), Some(Node::empty()));
    }

    #[test]
    fn child_writes_are_rebased() {
        let write = CompoundWrite::empty()
            .add_write(&p("a/b"), n(json!(1)))
            .add_write(&p("a/c/d"), n(json!(2)));
        let child = write.child_compound_write(&p("a"));
        assert_eq!(
            child.entries(),
            vec![(p("b"), n(json!(1))), (p("c/d"), n(json!(2)))]
        );
        let shadowed = write.child_compound_write(&p("a/b/x"));
        assert_eq!(shadowed.root_write(), Some(&Node::empty()));
        assert_eq!(write.child_compound_writes().len(), 1);
    }

    #[test]
    fn add_writes_rebases_entries() {
        let updates = CompoundWrite::from_child_merge(vec![
            (ChildKey::new("x"), n(json!(1))),
            (ChildKey::new("y"), n(json!(2))),
        ]);
        let write = CompoundWrite::empty().add_writes(&p("root"), &updates);
        assert_eq!(
            write.apply(&Node::empty()).to_json(),
            json!({"root": {"x": 1, "y": 2}})
        );
    }

    #[test]
    fn complete_children() {
        let write = CompoundWrite::empty()
            .add_write(&p("a"), n(json!(1)))
            .add_write(&p("b/c"), n(json!(2)));
        let names: Vec<_> = write
            .complete_children()
            .into_iter()
            .map(|c| c.name().as_str().to_string())
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn disjoint_merge_accepts_siblings() {
        let write = CompoundWrite::from_disjoint_merge(vec![
            (p("a/b"), n(json!(1))),
            (p("a/c"), n(json!(2))),
        ]);
        assert_eq!(write.entries().len(), 2);
    }

    #[test]
    #[should_panic(expected = "is an ancestor of")]
    fn disjoint_merge_rejects_nested_paths() {
        let _ = CompoundWrite::from_disjoint_merge(vec![
            (p("a/b/c"), n(json!(1))),
            (p("a/b"), n(json!(2))),
        ]);
    }
}
