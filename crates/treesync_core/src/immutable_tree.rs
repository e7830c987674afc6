//! A persistent tree of optional values keyed by path.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::key::ChildKey;
use crate::path::Path;

/// A persistent tree that stores an optional value at every path.
///
/// Updates return a new tree sharing every untouched subtree with the old
/// one. Empty subtrees are pruned eagerly, so a tree is empty exactly when
/// it stores no values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmutableTree<T> {
    value: Option<T>,
    children: Arc<BTreeMap<ChildKey, ImmutableTree<T>>>,
}

impl<T> Default for ImmutableTree<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: Arc::new(BTreeMap::new()),
        }
    }
}

impl<T: Clone> ImmutableTree<T> {
    /// A tree with no values.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A tree holding `value` at the root.
    pub fn leaf(value: T) -> Self {
        Self {
            value: Some(value),
            children: Arc::new(BTreeMap::new()),
        }
    }

    /// The value at the root.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// True if no value is stored anywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Immediate subtrees in key order.
    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &ImmutableTree<T>)> {
        self.children.iter()
    }

    /// The immediate subtree under `key`.
    #[must_use]
    pub fn child(&self, key: &ChildKey) -> Option<&ImmutableTree<T>> {
        self.children.get(key)
    }

    /// The value stored exactly at `path`.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&T> {
        let mut node = self;
        for key in path {
            node = node.children.get(key)?;
        }
        node.value.as_ref()
    }

    /// The subtree rooted at `path`, or an empty tree.
    #[must_use]
    pub fn subtree(&self, path: &Path) -> ImmutableTree<T> {
        let mut node = self;
        for key in path {
            match node.children.get(key) {
                Some(child) => node = child,
                None => return Self::empty(),
            }
        }
        node.clone()
    }

    /// A borrowed view of the subtree rooted at `path`, if one exists.
    #[must_use]
    pub fn descendant(&self, path: &Path) -> Option<&ImmutableTree<T>> {
        let mut node = self;
        for key in path {
            node = node.children.get(key)?;
        }
        Some(node)
    }

    /// The shallowest path on the way to `path` (inclusive) whose value
    /// satisfies `predicate`, relative to this tree.
    pub fn find_root_most_matching_path(
        &self,
        path: &Path,
        predicate: impl Fn(&T) -> bool,
    ) -> Option<Path> {
        let mut node = self;
        let mut walked = Vec::new();
        loop {
            if node.value.as_ref().is_some_and(&predicate) {
                return Some(Path::from_keys(walked));
            }
            let key = path.iter().nth(walked.len())?;
            node = node.children.get(key)?;
            walked.push(key.clone());
        }
    }

    /// The shallowest path on the way to `path` that holds any value.
    #[must_use]
    pub fn find_root_most_path_with_value(&self, path: &Path) -> Option<Path> {
        self.find_root_most_matching_path(path, |_| true)
    }

    /// The shallowest value on the way to `path` satisfying `predicate`.
    pub fn root_most_value_matching(&self, path: &Path, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        let mut node = self;
        let mut remaining = path.iter();
        loop {
            if let Some(value) = node.value.as_ref().filter(|v| predicate(v)) {
                return Some(value);
            }
            node = node.children.get(remaining.next()?)?;
        }
    }

    /// The shallowest value on the way to `path`.
    #[must_use]
    pub fn root_most_value(&self, path: &Path) -> Option<&T> {
        self.root_most_value_matching(path, |_| true)
    }

    /// The deepest value on the way to `path` satisfying `predicate`.
    pub fn leaf_most_value_matching(&self, path: &Path, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        let mut node = self;
        let mut found = node.value.as_ref().filter(|v| predicate(v));
        for key in path {
            match node.children.get(key) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(value) = node.value.as_ref().filter(|v| predicate(v)) {
                found = Some(value);
            }
        }
        found
    }

    /// The deepest value on the way to `path`.
    #[must_use]
    pub fn leaf_most_value(&self, path: &Path) -> Option<&T> {
        self.leaf_most_value_matching(path, |_| true)
    }

    /// True if any stored value satisfies `predicate`.
    pub fn contains_matching_value(&self, predicate: &impl Fn(&T) -> bool) -> bool {
        self.value.as_ref().is_some_and(predicate)
            || self
                .children
                .values()
                .any(|child| child.contains_matching_value(predicate))
    }

    /// Stores `value` at `path`.
    #[must_use]
    pub fn set(&self, path: &Path, value: T) -> Self {
        match path.front() {
            None => Self {
                value: Some(value),
                children: Arc::clone(&self.children),
            },
            Some(front) => {
                let child = self.children.get(front).cloned().unwrap_or_default();
                let child = child.set(&path.pop_front(), value);
                self.with_child(front, child)
            }
        }
    }

    /// Removes the value at `path`, keeping any values below it.
    #[must_use]
    pub fn remove(&self, path: &Path) -> Self {
        match path.front() {
            None => Self {
                value: None,
                children: Arc::clone(&self.children),
            },
            Some(front) => match self.children.get(front) {
                Some(child) => self.with_child(front, child.remove(&path.pop_front())),
                None => self.clone(),
            },
        }
    }

    /// Replaces the whole subtree at `path`.
    #[must_use]
    pub fn set_tree(&self, path: &Path, tree: ImmutableTree<T>) -> Self {
        match path.front() {
            None => tree,
            Some(front) => {
                let child = self.children.get(front).cloned().unwrap_or_default();
                self.with_child(front, child.set_tree(&path.pop_front(), tree))
            }
        }
    }

    /// Mutable access to the root value. Shared nodes are copied first.
    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Mutable access to the immediate subtree under `key`.
    pub fn child_mut(&mut self, key: &ChildKey) -> Option<&mut ImmutableTree<T>> {
        Arc::make_mut(&mut self.children).get_mut(key)
    }

    /// Mutable access to every immediate subtree, in key order.
    pub fn children_mut(&mut self) -> impl Iterator<Item = (&ChildKey, &mut ImmutableTree<T>)> {
        Arc::make_mut(&mut self.children).iter_mut()
    }

    /// Mutable access to the value stored exactly at `path`.
    pub fn get_mut(&mut self, path: &Path) -> Option<&mut T> {
        let mut node = self;
        for key in path {
            node = node.child_mut(key)?;
        }
        node.value.as_mut()
    }

    fn with_child(&self, key: &ChildKey, child: ImmutableTree<T>) -> Self {
        let mut children = (*self.children).clone();
        if child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.clone(), child);
        }
        Self {
            value: self.value.clone(),
            children: Arc::new(children),
        }
    }

    /// Folds over every stored value, children before parents, with paths
    /// relative to this tree.
    pub fn fold<A>(&self, init: A, mut visit: impl FnMut(&Path, &T, A) -> A) -> A {
        self.fold_at(&Path::empty(), init, &mut visit)
    }

    fn fold_at<A>(&self, at: &Path, mut acc: A, visit: &mut impl FnMut(&Path, &T, A) -> A) -> A {
        for (key, child) in self.children.iter() {
            acc = child.fold_at(&at.child(key), acc, visit);
        }
        if let Some(value) = &self.value {
            acc = visit(at, value, acc);
        }
        acc
    }

    /// Every stored value with its path, parents before children, siblings
    /// in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Path, T)> {
        let mut out = Vec::new();
        self.collect_entries(&Path::empty(), &mut out);
        out
    }

    fn collect_entries(&self, at: &Path, out: &mut Vec<(Path, T)>) {
        if let Some(value) = &self.value {
            out.push((at.clone(), value.clone()));
        }
        for (key, child) in self.children.iter() {
            child.collect_entries(&at.child(key), out);
        }
    }

    /// Every stored value, parents before children.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn set_get_remove() {
        let tree = ImmutableTree::empty().set(&p("a/b"), 1).set(&p("a"), 2);
        assert_eq!(tree.get(&p("a/b")), Some(&1));
        assert_eq!(tree.get(&p("a")), Some(&2));
        assert_eq!(tree.get(&p("a/c")), None);

        let removed = tree.remove(&p("a/b"));
        assert_eq!(removed.get(&p("a/b")), None);
        assert_eq!(removed.get(&p("a")), Some(&2));
        assert!(removed.remove(&p("a")).is_empty());
    }

    #[test]
    fn root_most_and_leaf_most() {
        let tree = ImmutableTree::empty().set(&p("a"), "a").set(&p("a/b/c"), "c");
        assert_eq!(tree.root_most_value(&p("a/b/c/d")), Some(&"a"));
        assert_eq!(tree.leaf_most_value(&p("a/b/c/d")), Some(&"c"));
        assert_eq!(tree.leaf_most_value(&p("a/x")), Some(&"a"));
        assert_eq!(tree.find_root_most_path_with_value(&p("a/b")), Some(p("a")));
        assert_eq!(
            tree.find_root_most_matching_path(&p("a/b/c"), |v| *v == "c"),
            Some(p("a/b/c"))
        );
        assert_eq!(tree.root_most_value(&p("z")), None);
    }

    #[test]
    fn set_tree_replaces_subtree() {
        let tree = ImmutableTree::empty().set(&p("a/b"), 1).set(&p("a/c"), 2);
        let replaced = tree.set_tree(&p("a"), ImmutableTree::leaf(9));
        assert_eq!(replaced.entries(), vec![(p("a"), 9)]);
        let cleared = tree.set_tree(&p("a/b"), ImmutableTree::empty());
        assert_eq!(cleared.entries(), vec![(p("a/c"), 2)]);
    }

    #[test]
    fn fold_visits_children_first() {
        let tree = ImmutableTree::empty().set(&Path::empty(), 0).set(&p("a"), 1).set(&p("b"), 2);
        let order = tree.fold(Vec::new(), |path, value, mut acc| {
            acc.push((path.to_string(), *value));
            acc
        });
        assert_eq!(
            order,
            vec![("/a".to_string(), 1), ("/b".to_string(), 2), ("/".to_string(), 0)]
        );
    }

    #[test]
    fn mutation_in_place_leaves_clones_alone() {
        let mut tree = ImmutableTree::empty().set(&p("a/b"), 1).set(&p("c"), 2);
        let before = tree.clone();
        *tree.get_mut(&p("a/b")).unwrap() += 10;
        for (_, child) in tree.children_mut() {
            if let Some(value) = child.value_mut() {
                *value *= 3;
            }
        }
        assert_eq!(tree.get(&p("a/b")), Some(&11));
        assert_eq!(tree.get(&p("c")), Some(&6));
        assert_eq!(before.get(&p("a/b")), Some(&1));
        assert!(tree.get_mut(&p("a/zz")).is_none());
    }

    #[test]
    fn subtree_and_matching() {
        let tree = ImmutableTree::empty().set(&p("x/y"), true).set(&p("x/z"), false);
        assert_eq!(tree.subtree(&p("x")).values().len(), 2);
        assert!(tree.subtree(&p("q")).is_empty());
        assert_eq!(tree.descendant(&p("x")).map(|t| t.values().len()), Some(2));
        assert!(tree.descendant(&p("x/q")).is_none());
        assert!(tree.contains_matching_value(&|v: &bool| !*v));
        assert!(!tree.subtree(&p("x/y")).contains_matching_value(&|v: &bool| !*v));
    }
}
