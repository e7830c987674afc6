//! Collapses the changes made to each child during one operation.

use std::collections::BTreeMap;

use treesync_core::ChildKey;

use super::change::Change;
use crate::event::EventType;

/// Keeps at most one change per child.
///
/// Applying an operation can touch a child several times (a limited
/// window removes and re-adds it, a merge updates it twice). Only the net
/// effect is reported.
#[derive(Debug, Default)]
pub(crate) struct ChildChangeAccumulator {
    changes: BTreeMap<ChildKey, Change>,
}

impl ChildChangeAccumulator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a child change, folding it into any earlier one.
    ///
    /// # Panics
    ///
    /// Panics for value changes, changes without a key, priority keys, and
    /// sequences that cannot happen (e.g. a child added twice).
    pub(crate) fn track_child_change(&mut self, change: Change) {
        let event_type = change.event_type;
        assert!(
            matches!(
                event_type,
                EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved
            ),
            "only child changes can be tracked"
        );
        let Some(key) = change.child_key.clone() else {
            panic!("child change without a key");
        };
        assert!(!key.is_priority(), "changes to the priority are not child changes");

        let Some(previous) = self.changes.remove(&key) else {
            self.changes.insert(key, change);
            return;
        };
        let merged = match (previous.event_type, event_type) {
            (EventType::ChildRemoved, EventType::ChildAdded) => Some(Change::child_changed(
                key.clone(),
                change.node().clone(),
                previous.node().clone(),
            )),
            (EventType::ChildAdded, EventType::ChildRemoved) => None,
            (EventType::ChildChanged, EventType::ChildRemoved) => Some(Change::child_removed(
                key.clone(),
                previous.old_node.clone().unwrap_or_default(),
            )),
            (EventType::ChildAdded, EventType::ChildChanged) => {
                Some(Change::child_added(key.clone(), change.node().clone()))
            }
            (EventType::ChildChanged, EventType::ChildChanged) => Some(Change::child_changed(
                key.clone(),
                change.node().clone(),
                previous.old_node.clone().unwrap_or_default(),
            )),
            (earlier, later) => {
                panic!("illegal combination of changes: {later:?} occurred after {earlier:?} for {key}")
            }
        };
        if let Some(merged) = merged {
            self.changes.insert(key, merged);
        }
    }

    /// The collapsed changes, in key order.
    pub(crate) fn into_changes(self) -> Vec<Change> {
        self.changes.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_core::Node;

    fn key(name: &str) -> ChildKey {
        ChildKey::new(name)
    }

    #[test]
    fn removed_then_added_is_changed() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track_child_change(Change::child_removed(key("a"), Node::from(1_i64)));
        acc.track_child_change(Change::child_added(key("a"), Node::from(2_i64)));
        let changes = acc.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].event_type, EventType::ChildChanged);
        assert_eq!(changes[0].node(), &Node::from(2_i64));
        assert_eq!(changes[0].old_node, Some(Node::from(1_i64)));
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track_child_change(Change::child_added(key("a"), Node::from(1_i64)));
        acc.track_child_change(Change::child_removed(key("a"), Node::from(1_i64)));
        assert!(acc.into_changes().is_empty());
    }

    #[test]
    fn changes_keep_the_original_old_value() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track_child_change(Change::child_changed(key("a"), Node::from(2_i64), Node::from(1_i64)));
        acc.track_child_change(Change::child_changed(key("a"), Node::from(3_i64), Node::from(2_i64)));
        acc.track_child_change(Change::child_added(key("b"), Node::from(1_i64)));
        acc.track_child_change(Change::child_changed(key("b"), Node::from(5_i64), Node::from(1_i64)));
        let changes = acc.into_changes();
        assert_eq!(changes[0].old_node, Some(Node::from(1_i64)));
        assert_eq!(changes[0].node(), &Node::from(3_i64));
        assert_eq!(changes[1].event_type, EventType::ChildAdded);
        assert_eq!(changes[1].node(), &Node::from(5_i64));
    }

    #[test]
    fn changed_then_removed_reports_the_old_value() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track_child_change(Change::child_changed(key("a"), Node::from(2_i64), Node::from(1_i64)));
        acc.track_child_change(Change::child_removed(key("a"), Node::from(2_i64)));
        let changes = acc.into_changes();
        assert_eq!(changes[0].event_type, EventType::ChildRemoved);
        assert_eq!(changes[0].node(), &Node::from(1_i64));
    }

    #[test]
    #[should_panic(expected = "illegal combination")]
    fn double_add_panics() {
        let mut acc = ChildChangeAccumulator::new();
        acc.track_child_change(Change::child_added(key("a"), Node::from(1_i64)));
        acc.track_child_change(Change::child_added(key("a"), Node::from(1_i64)));
    }
}
