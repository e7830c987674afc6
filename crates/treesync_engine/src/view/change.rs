//! Raw changes produced by the view processor.

use treesync_core::{ChildKey, IndexedNode, Node};

use crate::event::EventType;

/// One change to a view, before it is turned into events.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub(crate) event_type: EventType,
    pub(crate) indexed_node: IndexedNode,
    pub(crate) child_key: Option<ChildKey>,
    pub(crate) old_node: Option<Node>,
}

impl Change {
    fn new(
        event_type: EventType,
        indexed_node: IndexedNode,
        child_key: Option<ChildKey>,
        old_node: Option<Node>,
    ) -> Self {
        Self {
            event_type,
            indexed_node,
            child_key,
            old_node,
        }
    }

    pub(crate) fn value(snapshot: IndexedNode) -> Self {
        Self::new(EventType::Value, snapshot, None, None)
    }

    pub(crate) fn child_added(key: ChildKey, snapshot: Node) -> Self {
        Self::new(EventType::ChildAdded, IndexedNode::from_node(snapshot), Some(key), None)
    }

    pub(crate) fn child_removed(key: ChildKey, snapshot: Node) -> Self {
        Self::new(EventType::ChildRemoved, IndexedNode::from_node(snapshot), Some(key), None)
    }

    pub(crate) fn child_changed(key: ChildKey, new_snapshot: Node, old_snapshot: Node) -> Self {
        Self::new(
            EventType::ChildChanged,
            IndexedNode::from_node(new_snapshot),
            Some(key),
            Some(old_snapshot),
        )
    }

    pub(crate) fn child_moved(key: ChildKey, snapshot: Node) -> Self {
        Self::new(EventType::ChildMoved, IndexedNode::from_node(snapshot), Some(key), None)
    }

    pub(crate) fn node(&self) -> &Node {
        self.indexed_node.node()
    }
}
