//! Content hashing for nodes.
//!
//! The hash is sent along with a listen so the server can skip resending
//! data the client already has.

use sha2::{Digest, Sha256};

use super::{LeafValue, Node, Priority};

impl Node {
    /// Hex encoded SHA-256 digest of the node's canonical representation.
    /// The empty node hashes to the empty string.
    #[must_use]
    pub fn content_hash(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    fn feed(&self, hasher: &mut Sha256) {
        match self.priority() {
            Priority::None => {}
            Priority::Number(n) => hasher.update(format!("priority:number:{n}:")),
            Priority::String(s) => hasher.update(format!("priority:string:{s}:")),
        }
        if let Some(value) = self.leaf_value() {
            match value {
                LeafValue::Bool(b) => hasher.update(format!("boolean:{b}")),
                LeafValue::Number(n) => hasher.update(format!("number:{n}")),
                LeafValue::String(s) => hasher.update(format!("string:{s}")),
            }
            return;
        }
        for (key, child) in self.children() {
            hasher.update(format!(":{}:{}:", key.as_str().len(), key));
            child.feed(hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_nodes_hash_equally() {
        let a = Node::from_json(&json!({"x": 1, "y": {"z": "s"}})).unwrap();
        let b = Node::from_json(&json!({"y": {"z": "s"}, "x": 1})).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn priority_and_type_change_the_hash() {
        let plain = Node::from_json(&json!({"x": 1})).unwrap();
        let prioritized = Node::from_json(&json!({"x": 1, ".priority": 1})).unwrap();
        let stringy = Node::from_json(&json!({"x": "1"})).unwrap();
        assert_ne!(plain.content_hash(), prioritized.content_hash());
        assert_ne!(plain.content_hash(), stringy.content_hash());
    }

    #[test]
    fn empty_hash_is_empty() {
        assert_eq!(Node::empty().content_hash(), "");
    }
}
