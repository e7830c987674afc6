//! Placeholders the server fills in when it applies a write.
//!
//! `{".sv": "timestamp"}` becomes the server time and
//! `{".sv": {"increment": n}}` adds `n` to the current number. Local
//! caches resolve them against a clock so they hold a plausible value until
//! the server's own arrives.

use treesync_core::{ChildKey, Clock, CompoundWrite, LeafValue, Node, Path};

const SERVER_VALUE_KEY: &str = ".sv";
const TIMESTAMP_OP: &str = "timestamp";
const INCREMENT_OP: &str = "increment";

/// Values substituted for server-value placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerValues {
    timestamp: i64,
}

impl ServerValues {
    /// Captures the current time of `clock`.
    pub fn generate(clock: &dyn Clock) -> Self {
        Self {
            timestamp: clock.millis(),
        }
    }

    /// The time substituted for `timestamp` placeholders.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Resolves every placeholder in `data`. `existing` is the current value
    /// at the same location and feeds increments.
    #[must_use]
    pub fn resolve_node(&self, data: &Node, existing: &Node) -> Node {
        if let Some(resolved) = self.resolve_placeholder(data, existing) {
            return resolved.with_priority(data.priority().clone());
        }
        if data.is_leaf() || data.is_empty() {
            return data.clone();
        }
        let mut resolved = data.clone();
        for (key, child) in data.children() {
            let resolved_child = self.resolve_node(child, &existing.immediate_child(key));
            if &resolved_child != child {
                resolved = resolved.update_immediate_child(key, resolved_child);
            }
        }
        resolved
    }

    /// Resolves every entry of a merge rooted at a location whose current
    /// value is `existing`.
    #[must_use]
    pub fn resolve_merge(&self, merge: &CompoundWrite, existing: &Node) -> CompoundWrite {
        merge
            .entries()
            .into_iter()
            .fold(CompoundWrite::empty(), |resolved, (path, node)| {
                let node = self.resolve_node(&node, &existing.child(&path));
                resolved.add_write(&path, node)
            })
    }

    fn resolve_placeholder(&self, data: &Node, existing: &Node) -> Option<Node> {
        let op = data.immediate_child(&ChildKey::new(SERVER_VALUE_KEY));
        if op.is_empty() {
            return None;
        }
        if let Some(LeafValue::String(name)) = op.leaf_value() {
            return (&**name == TIMESTAMP_OP).then(|| Node::from(self.timestamp));
        }
        let increment = match op.child(&Path::from_key(ChildKey::new(INCREMENT_OP))).leaf_value() {
            Some(LeafValue::Number(n)) => n.get(),
            _ => return None,
        };
        match existing.leaf_value() {
            Some(LeafValue::Number(current)) => Some(Node::from(current.get() + increment)),
            _ => Some(Node::from(increment)),
        }
    }
}
