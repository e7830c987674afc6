//! Per-query filtering of view caches.
//!
//! A view keeps only the children its query selects. [`NodeFilter`] applies
//! that selection to whole nodes and to single-child updates, and records
//! the resulting child changes.

use std::cmp::Ordering;

use treesync_core::{ChildKey, Index, IndexedNode, NamedNode, Node, Path, Priority, QueryParams};

use super::accumulator::ChildChangeAccumulator;
use super::change::Change;
use super::child_source::CompleteChildSource;

/// The filter matching a query's parameters.
#[derive(Debug, Clone)]
pub(crate) enum NodeFilter {
    /// Keeps everything; only orders children.
    Indexed(IndexedFilter),
    /// Keeps children inside a start/end range.
    Ranged(RangedFilter),
    /// Keeps a fixed number of children inside a range.
    Limited(LimitedFilter),
}

impl NodeFilter {
    /// Builds the filter for `params`.
    pub(crate) fn for_params(params: &QueryParams) -> Self {
        if params.loads_all_data() {
            Self::Indexed(IndexedFilter::new(params.index().clone()))
        } else if params.limit().is_some() {
            Self::Limited(LimitedFilter::new(params))
        } else {
            Self::Ranged(RangedFilter::new(params))
        }
    }

    /// Updates one child of `snap`, possibly pulling in replacement
    /// children from `source`.
    pub(crate) fn update_child(
        &self,
        snap: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        match self {
            Self::Indexed(filter) => filter.update_child(snap, key, new_child, affected_path, accumulator),
            Self::Ranged(filter) => filter.update_child(snap, key, new_child, affected_path, accumulator),
            Self::Limited(filter) => filter.update_child(snap, key, new_child, affected_path, source, accumulator),
        }
    }

    /// Replaces `old` with the filtered form of `new`.
    pub(crate) fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        match self {
            Self::Indexed(filter) => filter.update_full_node(old, new, accumulator),
            Self::Ranged(filter) => filter.update_full_node(old, new, accumulator),
            Self::Limited(filter) => filter.update_full_node(old, new, accumulator),
        }
    }

    /// Applies a priority update to the root of `old`. Filtered views do
    /// not track the root priority.
    pub(crate) fn update_priority(&self, old: &IndexedNode, priority: &Node) -> IndexedNode {
        match self {
            Self::Indexed(filter) => filter.update_priority(old, priority),
            Self::Ranged(_) | Self::Limited(_) => old.clone(),
        }
    }

    /// True if the filter can drop children.
    pub(crate) fn filters_nodes(&self) -> bool {
        !matches!(self, Self::Indexed(_))
    }

    /// The unfiltered filter for the same index.
    pub(crate) fn indexed_filter(&self) -> NodeFilter {
        let indexed = match self {
            Self::Indexed(filter) => filter,
            Self::Ranged(filter) => &filter.indexed,
            Self::Limited(filter) => &filter.ranged.indexed,
        };
        Self::Indexed(indexed.clone())
    }

    /// The ordering used by the filter.
    pub(crate) fn index(&self) -> &Index {
        match self {
            Self::Indexed(filter) => &filter.index,
            Self::Ranged(filter) => &filter.indexed.index,
            Self::Limited(filter) => &filter.ranged.indexed.index,
        }
    }
}

/// Orders children without dropping any.
#[derive(Debug, Clone)]
pub(crate) struct IndexedFilter {
    index: Index,
}

impl IndexedFilter {
    pub(crate) fn new(index: Index) -> Self {
        Self { index }
    }

    pub(crate) fn update_child(
        &self,
        snap: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        debug_assert!(snap.has_index(&self.index), "the snap is not indexed by the filter's index");
        let node = snap.node();
        let old_child = node.immediate_child(key);
        if old_child.child(affected_path) == new_child.child(affected_path)
            && old_child.is_empty() == new_child.is_empty()
        {
            return snap.clone();
        }

        if let Some(accumulator) = accumulator {
            if new_child.is_empty() {
                if node.has_child(key) {
                    accumulator.track_child_change(Change::child_removed(key.clone(), old_child));
                } else {
                    assert!(
                        node.is_leaf(),
                        "a child remove without an old child only makes sense on a leaf"
                    );
                }
            } else if old_child.is_empty() {
                accumulator.track_child_change(Change::child_added(key.clone(), new_child.clone()));
            } else {
                accumulator.track_child_change(Change::child_changed(
                    key.clone(),
                    new_child.clone(),
                    old_child,
                ));
            }
        }

        if node.is_leaf() && new_child.is_empty() {
            snap.clone()
        } else {
            snap.update_child(key, new_child)
        }
    }

    pub(crate) fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        if let Some(accumulator) = accumulator {
            let old_node = old.node();
            let new_node = new.node();
            for (key, child) in old_node.children() {
                if !new_node.has_child(key) {
                    accumulator.track_child_change(Change::child_removed(key.clone(), child.clone()));
                }
            }
            for (key, child) in new_node.children() {
                if old_node.has_child(key) {
                    let old_child = old_node.immediate_child(key);
                    if &old_child != child {
                        accumulator.track_child_change(Change::child_changed(
                            key.clone(),
                            child.clone(),
                            old_child,
                        ));
                    }
                } else {
                    accumulator.track_child_change(Change::child_added(key.clone(), child.clone()));
                }
            }
        }
        new.clone()
    }

    pub(crate) fn update_priority(&self, old: &IndexedNode, priority: &Node) -> IndexedNode {
        if old.node().is_empty() {
            old.clone()
        } else {
            old.update_priority(Priority::from_node(priority))
        }
    }
}

/// Drops children outside `[start, end]`.
#[derive(Debug, Clone)]
pub(crate) struct RangedFilter {
    indexed: IndexedFilter,
    start: Option<NamedNode>,
    end: Option<NamedNode>,
}

impl RangedFilter {
    pub(crate) fn new(params: &QueryParams) -> Self {
        Self {
            indexed: IndexedFilter::new(params.index().clone()),
            start: params.start_post(),
            end: params.end_post(),
        }
    }

    fn index(&self) -> &Index {
        &self.indexed.index
    }

    /// True if `node` falls inside the range. Missing bounds are open.
    pub(crate) fn matches(&self, node: &NamedNode) -> bool {
        let after_start = self
            .start
            .as_ref()
            .map_or(true, |start| self.index().compare(start, node) != Ordering::Greater);
        let before_end = self
            .end
            .as_ref()
            .map_or(true, |end| self.index().compare(node, end) != Ordering::Greater);
        after_start && before_end
    }

    fn update_child(
        &self,
        snap: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let new_child = if self.matches(&NamedNode::new(key.clone(), new_child.clone())) {
            new_child
        } else {
            Node::empty()
        };
        self.indexed
            .update_child(snap, key, new_child, affected_path, accumulator)
    }

    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let filtered = if new.node().is_leaf() {
            IndexedNode::new(Node::empty(), self.index().clone())
        } else {
            let mut filtered = new.update_priority(Priority::None);
            for child in new.iter() {
                if !self.matches(&child) {
                    filtered = filtered.update_child(child.name(), Node::empty());
                }
            }
            filtered
        };
        self.indexed.update_full_node(old, &filtered, accumulator)
    }
}

/// Keeps the first (or last) `limit` children inside a range.
#[derive(Debug, Clone)]
pub(crate) struct LimitedFilter {
    ranged: RangedFilter,
    limit: usize,
    reverse: bool,
}

impl LimitedFilter {
    pub(crate) fn new(params: &QueryParams) -> Self {
        Self {
            ranged: RangedFilter::new(params),
            limit: params.limit().map_or(usize::MAX, |limit| limit as usize),
            reverse: !params.is_view_from_left(),
        }
    }

    fn index(&self) -> &Index {
        self.ranged.index()
    }

    fn update_child(
        &self,
        snap: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let new_child = if self.ranged.matches(&NamedNode::new(key.clone(), new_child.clone())) {
            new_child
        } else {
            Node::empty()
        };
        if snap.node().immediate_child(key) == new_child {
            snap.clone()
        } else if snap.node().child_count() < self.limit {
            self.ranged
                .indexed
                .update_child(snap, key, new_child, affected_path, accumulator)
        } else {
            self.full_limit_update_child(snap, key, new_child, source, accumulator)
        }
    }

    /// Updates a child of a window that is already full.
    fn full_limit_update_child(
        &self,
        old: &IndexedNode,
        key: &ChildKey,
        new_child: Node,
        source: &dyn CompleteChildSource,
        mut accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let boundary = if self.reverse {
            old.first_child()
        } else {
            old.last_child()
        };
        let Some(boundary) = boundary else {
            // A zero limit holds nothing.
            return old.clone();
        };
        let index = self.index();
        let new_named = NamedNode::new(key.clone(), new_child.clone());
        let in_range = self.ranged.matches(&new_named);
        let old_node = old.node();

        if old_node.has_child(key) {
            let old_child = old_node.immediate_child(key);
            let mut next = source.child_after_child(index, &boundary, self.reverse);
            // Children already in the window (or this one) may show up again
            // when a merge updates several of them at once.
            while let Some(candidate) = next.as_ref() {
                if candidate.name() != key && !old_node.has_child(candidate.name()) {
                    break;
                }
                next = source.child_after_child(index, candidate, self.reverse);
            }
            let next_compares_after = next.as_ref().map_or(true, |next| {
                index.compare_directional(next, &new_named, self.reverse) != Ordering::Less
            });
            if in_range && !new_child.is_empty() && next_compares_after {
                if let Some(accumulator) = accumulator {
                    accumulator.track_child_change(Change::child_changed(key.clone(), new_child.clone(), old_child));
                }
                return old.update_child(key, new_child);
            }
            if let Some(accumulator) = accumulator.as_deref_mut() {
                accumulator.track_child_change(Change::child_removed(key.clone(), old_child));
            }
            let without = old.update_child(key, Node::empty());
            match next.filter(|next| self.ranged.matches(next)) {
                Some(next) => {
                    if let Some(accumulator) = accumulator {
                        accumulator.track_child_change(Change::child_added(next.name().clone(), next.node().clone()));
                    }
                    let (name, node) = next.into_parts();
                    without.update_child(&name, node)
                }
                None => without,
            }
        } else if new_child.is_empty() || !in_range {
            old.clone()
        } else if index.compare_directional(&boundary, &new_named, self.reverse) != Ordering::Less {
            if let Some(accumulator) = accumulator {
                accumulator.track_child_change(Change::child_removed(
                    boundary.name().clone(),
                    boundary.node().clone(),
                ));
                accumulator.track_child_change(Change::child_added(key.clone(), new_child.clone()));
            }
            old.update_child(key, new_child)
                .update_child(boundary.name(), Node::empty())
        } else {
            old.clone()
        }
    }

    fn update_full_node(
        &self,
        old: &IndexedNode,
        new: &IndexedNode,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedNode {
        let filtered = if new.node().is_leaf() || new.node().is_empty() {
            IndexedNode::new(Node::empty(), self.index().clone())
        } else {
            let (first, last) = if self.reverse {
                (self.ranged.end.as_ref(), self.ranged.start.as_ref())
            } else {
                (self.ranged.start.as_ref(), self.ranged.end.as_ref())
            };
            let index = self.index();
            let children: Vec<NamedNode> = if self.reverse {
                new.iter_rev().collect()
            } else {
                new.iter().collect()
            };
            let mut filtered = new.update_priority(Priority::None);
            let mut count = 0;
            let mut found_start = first.is_none();
            for child in children {
                if !found_start
                    && first.is_some_and(|first| {
                        index.compare_directional(first, &child, self.reverse) != Ordering::Greater
                    })
                {
                    found_start = true;
                }
                let before_end = last.map_or(true, |last| {
                    index.compare_directional(&child, last, self.reverse) != Ordering::Greater
                });
                if found_start && count < self.limit && before_end {
                    count += 1;
                } else {
                    filtered = filtered.update_child(child.name(), Node::empty());
                }
            }
            filtered
        };
        self.ranged.indexed.update_full_node(old, &filtered, accumulator)
    }
}
