//! The log of local writes that the server has not acknowledged yet.

use treesync_core::{
    CacheNode, ChildKey, CompoundWrite, Index, IndexedNode, NamedNode, Node, Path, UserWrite,
    UserWriteRecord, WriteId,
};

/// Pending local writes, in write-id order, plus the overlay of the
/// visible ones.
///
/// The overlay (`visible_writes`) answers most reads directly. Reads that
/// must skip particular writes, or include hidden ones, rebuild the overlay
/// for one location from the log.
#[derive(Debug, Clone, Default)]
pub struct WriteTree {
    visible_writes: CompoundWrite,
    all_writes: Vec<UserWriteRecord>,
    last_write_id: Option<WriteId>,
}

impl WriteTree {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A view of the log rebased at `path`.
    pub fn child_writes(&self, path: &Path) -> WriteTreeRef<'_> {
        WriteTreeRef {
            tree_path: path.clone(),
            writes: self,
        }
    }

    /// Records an overwrite.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not larger than every id seen so far.
    pub fn add_overwrite(&mut self, path: Path, node: Node, write_id: WriteId, visible: bool) {
        self.check_write_id(write_id);
        if visible {
            self.visible_writes = self.visible_writes.add_write(&path, node.clone());
        }
        self.all_writes
            .push(UserWriteRecord::overwrite(write_id, path, node, visible));
        self.last_write_id = Some(write_id);
    }

    /// Records a merge. Merges are always visible.
    ///
    /// # Panics
    ///
    /// Panics if `write_id` is not larger than every id seen so far.
    pub fn add_merge(&mut self, path: Path, children: CompoundWrite, write_id: WriteId) {
        self.check_write_id(write_id);
        self.visible_writes = self.visible_writes.add_writes(&path, &children);
        self.all_writes
            .push(UserWriteRecord::merge(write_id, path, children));
        self.last_write_id = Some(write_id);
    }

    fn check_write_id(&self, write_id: WriteId) {
        if let Some(last) = self.last_write_id {
            assert!(
                write_id > last,
                "stacking an older write on top of newer ones ({write_id} after {last})"
            );
        }
    }

    /// The pending write with `write_id`.
    pub fn write(&self, write_id: WriteId) -> Option<&UserWriteRecord> {
        self.all_writes.iter().find(|w| w.write_id() == write_id)
    }

    /// Every pending write, oldest first.
    pub fn writes(&self) -> &[UserWriteRecord] {
        &self.all_writes
    }

    /// True if no write is pending.
    pub fn is_empty(&self) -> bool {
        self.all_writes.is_empty()
    }

    /// Drops every pending write and returns them, oldest first.
    pub fn purge_all_writes(&mut self) -> Vec<UserWriteRecord> {
        self.visible_writes = CompoundWrite::empty();
        std::mem::take(&mut self.all_writes)
    }

    /// Removes the write with `write_id` and reports whether that changes
    /// the visible overlay (callers must then re-evaluate affected views).
    ///
    /// # Panics
    ///
    /// Panics if no pending write has `write_id`.
    pub fn remove_write(&mut self, write_id: WriteId) -> bool {
        let index = self
            .all_writes
            .iter()
            .position(|w| w.write_id() == write_id);
        let Some(index) = index else {
            panic!("remove_write called with nonexistent {write_id}");
        };
        let removed = self.all_writes.remove(index);

        let mut was_visible = removed.is_visible();
        let mut overlaps_other_writes = false;
        for (i, current) in self.all_writes.iter().enumerate().rev() {
            if !was_visible {
                break;
            }
            if !current.is_visible() {
                continue;
            }
            if i >= index && current.covers(removed.path()) {
                // A later write shadows the removed one.
                was_visible = false;
            } else if removed.path().contains(current.path()) {
                overlaps_other_writes = true;
            }
        }

        if !was_visible {
            false
        } else if overlaps_other_writes {
            self.reset_tree();
            true
        } else {
            match removed.write() {
                UserWrite::Overwrite(_) => {
                    self.visible_writes = self.visible_writes.remove_write(removed.path());
                }
                UserWrite::Merge(children) => {
                    for (relative, _) in children.entries() {
                        self.visible_writes = self
                            .visible_writes
                            .remove_write(&removed.path().join(&relative));
                    }
                }
            }
            true
        }
    }

    fn reset_tree(&mut self) {
        self.visible_writes = layer_tree(&self.all_writes, UserWriteRecord::is_visible, &Path::empty());
    }

    /// The value a visible write forces at `path`, if any.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible_writes.complete_node(path)
    }

    /// Overlays pending writes on `complete_server_cache` at `tree_path`.
    ///
    /// Returns `None` if neither the server data nor the writes determine
    /// the value.
    pub fn calc_complete_event_cache(
        &self,
        tree_path: &Path,
        complete_server_cache: Option<&Node>,
        write_ids_to_exclude: &[WriteId],
        include_hidden_writes: bool,
    ) -> Option<Node> {
        if write_ids_to_exclude.is_empty() && !include_hidden_writes {
            if let Some(shadowing) = self.visible_writes.complete_node(tree_path) {
                return Some(shadowing);
            }
            let sub_merge = self.visible_writes.child_compound_write(tree_path);
            if sub_merge.is_empty() {
                return complete_server_cache.cloned();
            }
            if complete_server_cache.is_none() && !sub_merge.has_complete_write(&Path::empty()) {
                return None;
            }
            let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
            return Some(sub_merge.apply(&layered));
        }

        let merge = self.visible_writes.child_compound_write(tree_path);
        if !include_hidden_writes && merge.is_empty() {
            return complete_server_cache.cloned();
        }
        if !include_hidden_writes
            && complete_server_cache.is_none()
            && !merge.has_complete_write(&Path::empty())
        {
            return None;
        }
        let filter = |write: &UserWriteRecord| {
            (write.is_visible() || include_hidden_writes)
                && !write_ids_to_exclude.contains(&write.write_id())
                && (write.path().contains(tree_path) || tree_path.contains(write.path()))
        };
        let merge_at_path = layer_tree(&self.all_writes, filter, tree_path);
        let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
        Some(merge_at_path.apply(&layered))
    }

    /// The children at `tree_path` whose values are known, from the server
    /// children plus pending writes.
    pub fn calc_complete_event_children(&self, tree_path: &Path, complete_server_children: &Node) -> Node {
        if let Some(top_level_set) = self.visible_writes.complete_node(tree_path) {
            if top_level_set.is_leaf() {
                return Node::empty();
            }
            return Node::from_children(
                top_level_set
                    .children()
                    .map(|(key, child)| (key.clone(), child.clone())),
            );
        }
        let merge = self.visible_writes.child_compound_write(tree_path);
        let mut complete_children = Node::empty();
        for (key, child) in complete_server_children.children() {
            let node = merge
                .child_compound_write(&Path::from_key(key.clone()))
                .apply(child);
            complete_children = complete_children.update_immediate_child(key, node);
        }
        for child in merge.complete_children() {
            let (key, node) = child.into_parts();
            complete_children = complete_children.update_immediate_child(&key, node);
        }
        complete_children
    }

    /// The new event value at `tree_path/child_path` after a server
    /// overwrite there, or `None` if a visible write shadows it.
    pub fn calc_event_cache_after_server_overwrite(
        &self,
        tree_path: &Path,
        child_path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        let path = tree_path.join(child_path);
        if self.visible_writes.has_complete_write(&path) {
            return None;
        }
        let child_merge = self.visible_writes.child_compound_write(&path);
        let server_child = existing_server_snap.child(child_path);
        if child_merge.is_empty() {
            Some(server_child)
        } else {
            Some(child_merge.apply(&server_child))
        }
    }

    /// The complete value of one child, if writes or the server cache
    /// determine it.
    pub fn calc_complete_child(
        &self,
        tree_path: &Path,
        key: &ChildKey,
        existing_server_snap: &CacheNode,
    ) -> Option<Node> {
        let path = tree_path.child(key);
        if let Some(shadowing) = self.visible_writes.complete_node(&path) {
            return Some(shadowing);
        }
        if existing_server_snap.is_complete_for_child(key) {
            let child_merge = self.visible_writes.child_compound_write(&path);
            return Some(child_merge.apply(&existing_server_snap.node().immediate_child(key)));
        }
        None
    }

    /// The first child ordered after `post` (before it, if `reverse`) once
    /// writes are applied, or `None` if that cannot be determined.
    pub fn calc_next_node_after_post(
        &self,
        tree_path: &Path,
        complete_server_data: Option<&Node>,
        post: &NamedNode,
        reverse: bool,
        index: &Index,
    ) -> Option<NamedNode> {
        let merge = self.visible_writes.child_compound_write(tree_path);
        let to_iterate = match (merge.complete_node(&Path::empty()), complete_server_data) {
            (Some(shadowing), _) => shadowing,
            (None, Some(server)) => merge.apply(server),
            (None, None) => return None,
        };
        let indexed = IndexedNode::new(to_iterate, index.clone());
        let beyond = |candidate: &NamedNode| {
            index.compare_directional(candidate, post, reverse) == std::cmp::Ordering::Greater
        };
        if reverse {
            indexed.iter_rev().find(|c| beyond(c))
        } else {
            indexed.iter().find(|c| beyond(c))
        }
    }
}

/// Builds the overlay at `tree_root` from the writes accepted by `filter`.
fn layer_tree(
    writes: &[UserWriteRecord],
    filter: impl Fn(&UserWriteRecord) -> bool,
    tree_root: &Path,
) -> CompoundWrite {
    let mut compound = CompoundWrite::empty();
    for write in writes.iter().filter(|w| filter(w)) {
        let write_path = write.path();
        match write.write() {
            UserWrite::Overwrite(node) => {
                if tree_root.contains(write_path) {
                    compound = compound.add_write(&Path::relative(tree_root, write_path), node.clone());
                } else if write_path.contains(tree_root) {
                    let below = node.child(&Path::relative(write_path, tree_root));
                    compound = compound.add_write(&Path::empty(), below);
                }
            }
            UserWrite::Merge(children) => {
                if tree_root.contains(write_path) {
                    compound = compound.add_writes(&Path::relative(tree_root, write_path), children);
                } else if write_path.contains(tree_root) {
                    let relative = Path::relative(write_path, tree_root);
                    let below = children.child_compound_write(&relative);
                    compound = compound.add_writes(&Path::empty(), &below);
                }
            }
        }
    }
    compound
}

/// A [`WriteTree`] seen from one location.
///
/// Every path and node passed to or returned from the methods is relative
/// to that location.
#[derive(Debug, Clone)]
pub struct WriteTreeRef<'a> {
    tree_path: Path,
    writes: &'a WriteTree,
}

impl<'a> WriteTreeRef<'a> {
    /// The location this view is rebased at.
    pub fn path(&self) -> &Path {
        &self.tree_path
    }

    /// The same log seen from the child `key`.
    #[must_use]
    pub fn child(&self, key: &ChildKey) -> WriteTreeRef<'a> {
        WriteTreeRef {
            tree_path: self.tree_path.child(key),
            writes: self.writes,
        }
    }

    /// See [`WriteTree::shadowing_write`].
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.writes.shadowing_write(&self.tree_path.join(path))
    }

    /// See [`WriteTree::calc_complete_event_cache`]; only visible writes
    /// are applied.
    pub fn calc_complete_event_cache(&self, complete_server_cache: Option<&Node>) -> Option<Node> {
        self.writes
            .calc_complete_event_cache(&self.tree_path, complete_server_cache, &[], false)
    }

    /// See [`WriteTree::calc_complete_event_children`].
    pub fn calc_complete_event_children(&self, complete_server_children: &Node) -> Node {
        self.writes
            .calc_complete_event_children(&self.tree_path, complete_server_children)
    }

    /// See [`WriteTree::calc_event_cache_after_server_overwrite`].
    pub fn calc_event_cache_after_server_overwrite(
        &self,
        child_path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        self.writes
            .calc_event_cache_after_server_overwrite(&self.tree_path, child_path, existing_server_snap)
    }

    /// See [`WriteTree::calc_complete_child`].
    pub fn calc_complete_child(&self, key: &ChildKey, existing_server_snap: &CacheNode) -> Option<Node> {
        self.writes
            .calc_complete_child(&self.tree_path, key, existing_server_snap)
    }

    /// See [`WriteTree::calc_next_node_after_post`].
    pub fn calc_next_node_after_post(
        &self,
        complete_server_data: Option<&Node>,
        post: &NamedNode,
        reverse: bool,
        index: &Index,
    ) -> Option<NamedNode> {
        self.writes
            .calc_next_node_after_post(&self.tree_path, complete_server_data, post, reverse, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn n(value: serde_json::Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn id(n: u64) -> WriteId {
        WriteId::new(n)
    }

    #[test]
    fn visible_writes_shadow_the_server() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a/foo"), n(json!(1)), id(1), true);
        let server = n(json!({"foo": 0, "bar": 2}));
        let event = tree.calc_complete_event_cache(&p("a"), Some(&server), &[], false);
        assert_eq!(event, Some(n(json!({"foo": 1, "bar": 2}))));
        assert_eq!(tree.shadowing_write(&p("a/foo")), Some(n(json!(1))));
        assert_eq!(tree.shadowing_write(&p("a")), None);
    }

    #[test]
    fn hidden_writes_are_only_seen_on_request() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!("hidden")), id(1), false);
        let server = n(json!("server"));
        assert_eq!(
            tree.calc_complete_event_cache(&p("a"), Some(&server), &[], false),
            Some(server.clone())
        );
        assert_eq!(
            tree.calc_complete_event_cache(&p("a"), Some(&server), &[], true),
            Some(n(json!("hidden")))
        );
    }

    #[test]
    fn excluded_writes_are_skipped() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!({"x": 1})), id(1), true);
        tree.add_overwrite(p("a/y"), n(json!(2)), id(2), true);
        let server = Node::empty();
        let without_second = tree.calc_complete_event_cache(&p("a"), Some(&server), &[id(2)], false);
        assert_eq!(without_second, Some(n(json!({"x": 1}))));
        let without_both = tree.calc_complete_event_cache(&p("a"), Some(&server), &[id(1), id(2)], false);
        assert_eq!(without_both, Some(Node::empty()));
    }

    #[test]
    fn incomplete_without_server_data() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a/b"), n(json!(1)), id(1), true);
        assert_eq!(tree.calc_complete_event_cache(&p("a"), None, &[], false), None);
        assert_eq!(
            tree.calc_complete_event_cache(&p("a/b"), None, &[], false),
            Some(n(json!(1)))
        );
        assert_eq!(
            tree.calc_complete_event_children(&p("a"), &Node::empty()),
            n(json!({"b": 1}))
        );
    }

    #[test]
    fn removing_a_shadowed_write_changes_nothing() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a/b"), n(json!(1)), id(1), true);
        tree.add_overwrite(p("a"), n(json!({"b": 2})), id(2), true);
        assert!(!tree.remove_write(id(1)));
        assert_eq!(tree.shadowing_write(&p("a/b")), Some(n(json!(2))));
        assert!(tree.remove_write(id(2)));
        assert!(tree.is_empty());
        assert_eq!(tree.shadowing_write(&p("a")), None);
    }

    #[test]
    fn removing_an_overlapped_write_rebuilds_the_overlay() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!({"b": 1, "c": 1})), id(1), true);
        tree.add_overwrite(p("a/c"), n(json!(2)), id(2), true);
        assert!(tree.remove_write(id(1)));
        assert_eq!(tree.shadowing_write(&p("a/c")), Some(n(json!(2))));
        assert_eq!(tree.shadowing_write(&p("a/b")), None);
    }

    #[test]
    fn merges_are_removed_per_child() {
        let mut tree = WriteTree::new();
        let children = CompoundWrite::from_child_merge(vec![
            (ChildKey::new("x"), n(json!(1))),
            (ChildKey::new("y"), n(json!(2))),
        ]);
        tree.add_merge(p("m"), children, id(1));
        assert_eq!(tree.shadowing_write(&p("m/y")), Some(n(json!(2))));
        assert!(tree.remove_write(id(1)));
        assert_eq!(tree.shadowing_write(&p("m/x")), None);
        assert_eq!(tree.shadowing_write(&p("m/y")), None);
    }

    #[test]
    #[should_panic(expected = "stacking an older write")]
    fn write_ids_must_increase() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!(1)), id(5), true);
        tree.add_overwrite(p("b"), n(json!(1)), id(4), true);
    }

    #[test]
    #[should_panic(expected = "nonexistent")]
    fn removing_an_unknown_write_panics() {
        let mut tree = WriteTree::new();
        tree.remove_write(id(1));
    }

    #[test]
    fn purge_returns_everything() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a"), n(json!(1)), id(1), true);
        tree.add_overwrite(p("b"), n(json!(2)), id(2), false);
        let purged = tree.purge_all_writes();
        assert_eq!(purged.len(), 2);
        assert!(tree.is_empty());
        assert_eq!(tree.shadowing_write(&p("a")), None);
    }

    #[test]
    fn complete_child_needs_writes_or_server_data() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("a/x"), n(json!(1)), id(1), true);
        let writes = tree.child_writes(&p("a"));
        let unknown = CacheNode::new(IndexedNode::from_node(Node::empty()), false, false);
        assert_eq!(writes.calc_complete_child(&ChildKey::new("x"), &unknown), Some(n(json!(1))));
        assert_eq!(writes.calc_complete_child(&ChildKey::new("y"), &unknown), None);
        let known = CacheNode::new(IndexedNode::from_node(n(json!({"y": 3}))), true, false);
        assert_eq!(writes.calc_complete_child(&ChildKey::new("y"), &known), Some(n(json!(3))));
        assert_eq!(writes.child(&ChildKey::new("x")).path(), &p("a/x"));
    }

    #[test]
    fn next_node_after_post_sees_writes() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(p("list/b"), n(json!(2)), id(1), true);
        let server = n(json!({"a": 1, "c": 3}));
        let writes = tree.child_writes(&p("list"));
        let post = NamedNode::new(ChildKey::new("a"), n(json!(1)));
        let next = writes
            .calc_next_node_after_post(Some(&server), &post, false, &Index::Value)
            .unwrap();
        assert_eq!(next.name().as_str(), "b");
        let post = NamedNode::new(ChildKey::new("c"), n(json!(3)));
        let prev = writes
            .calc_next_node_after_post(Some(&server), &post, true, &Index::Value)
            .unwrap();
        assert_eq!(prev.name().as_str(), "b");
        assert!(writes
            .calc_next_node_after_post(None, &post, true, &Index::Value)
            .is_none());
    }
}
