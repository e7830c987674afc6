//! Conversion between nodes and JSON.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{LeafValue, Node, Number, Priority};
use crate::error::{CoreError, CoreResult};
use crate::key::ChildKey;

const VALUE_KEY: &str = ".value";
const PRIORITY_KEY: &str = ".priority";

impl Node {
    /// Builds a node from JSON.
    ///
    /// `null` is the empty node and arrays become integer-keyed children.
    /// Objects may carry `.priority`, and `{".value": v, ".priority": p}`
    /// wraps a prioritized scalar.
    ///
    /// # Errors
    ///
    /// Returns an error for non-finite numbers, non-scalar `.value` wrappers
    /// and priorities that are neither numbers nor strings.
    pub fn from_json(value: &Value) -> CoreResult<Node> {
        match value {
            Value::Null => Ok(Node::empty()),
            Value::Bool(b) => Ok(Node::from(*b)),
            Value::Number(n) => Ok(Node::leaf(LeafValue::Number(number_from_json(n)?))),
            Value::String(s) => Ok(Node::from(s.as_str())),
            Value::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    children.push((ChildKey::new(&index.to_string()), Node::from_json(item)?));
                }
                Ok(Node::from_children(children))
            }
            Value::Object(map) => Self::from_json_object(map),
        }
    }

    fn from_json_object(map: &Map<String, Value>) -> CoreResult<Node> {
        let priority = match map.get(PRIORITY_KEY) {
            Some(raw) => priority_from_json(raw)?,
            None => Priority::None,
        };
        if let Some(wrapped) = map.get(VALUE_KEY) {
            if wrapped.is_object() || wrapped.is_array() {
                return Err(CoreError::invalid_value(".value must wrap a scalar"));
            }
            return Ok(Node::from_json(wrapped)?.with_priority(priority));
        }
        let mut children = Vec::with_capacity(map.len());
        for (key, child) in map {
            if key == PRIORITY_KEY {
                continue;
            }
            children.push((ChildKey::new(key), Node::from_json(child)?));
        }
        Ok(Node::from_children(children).with_priority(priority))
    }

    /// Exports the plain value, without priorities.
    ///
    /// Objects whose keys are all small non-negative integers are exported
    /// as arrays when at least half of the slots are filled.
    #[must_use]
    pub fn to_json(&self) -> Value {
        self.json_value(false)
    }

    /// Exports the value with `.priority` and `.value` markers so that
    /// [`Node::from_json`] reproduces the node exactly.
    #[must_use]
    pub fn to_export_json(&self) -> Value {
        self.json_value(true)
    }

    fn json_value(&self, export: bool) -> Value {
        if let Some(value) = self.leaf_value() {
            let scalar = leaf_to_json(value);
            if export && !self.priority().is_none() {
                let mut map = Map::new();
                map.insert(VALUE_KEY.to_string(), scalar);
                map.insert(PRIORITY_KEY.to_string(), priority_to_json(self.priority()));
                return Value::Object(map);
            }
            return scalar;
        }
        if self.is_empty() {
            return Value::Null;
        }
        if !export {
            if let Some(array) = self.as_array() {
                return array;
            }
        }
        let mut map = Map::new();
        for (key, child) in self.children() {
            map.insert(key.as_str().to_string(), child.json_value(export));
        }
        if export && !self.priority().is_none() {
            map.insert(PRIORITY_KEY.to_string(), priority_to_json(self.priority()));
        }
        Value::Object(map)
    }

    fn as_array(&self) -> Option<Value> {
        let mut max_index = 0_usize;
        for (key, _) in self.children() {
            let index = usize::try_from(key.int_value()?).ok()?;
            if key.as_str() != index.to_string() {
                return None;
            }
            max_index = max_index.max(index);
        }
        if max_index >= 2 * self.child_count() {
            return None;
        }
        let mut items = vec![Value::Null; max_index + 1];
        for (key, child) in self.children() {
            let index = usize::try_from(key.int_value()?).ok()?;
            items[index] = child.to_json();
        }
        Some(Value::Array(items))
    }
}

fn number_from_json(n: &serde_json::Number) -> CoreResult<Number> {
    match n.as_f64() {
        Some(f) if f.is_finite() => Ok(Number::new(f)),
        _ => Err(CoreError::invalid_value(format!("number {n} is not finite"))),
    }
}

fn priority_from_json(raw: &Value) -> CoreResult<Priority> {
    match raw {
        Value::Null => Ok(Priority::None),
        Value::Number(n) => Ok(Priority::Number(number_from_json(n)?)),
        Value::String(s) => Ok(Priority::String(Arc::from(s.as_str()))),
        other => Err(CoreError::invalid_priority(format!(
            "{other} is neither a number nor a string"
        ))),
    }
}

fn number_to_json(n: Number) -> Value {
    match n.as_i64() {
        Some(int) => Value::from(int),
        None => serde_json::Number::from_f64(n.get()).map_or(Value::Null, Value::Number),
    }
}

fn leaf_to_json(value: &LeafValue) -> Value {
    match value {
        LeafValue::Bool(b) => Value::Bool(*b),
        LeafValue::Number(n) => number_to_json(*n),
        LeafValue::String(s) => Value::String(s.to_string()),
    }
}

fn priority_to_json(priority: &Priority) -> Value {
    match priority {
        Priority::None => Value::Null,
        Priority::Number(n) => number_to_json(*n),
        Priority::String(s) => Value::String(s.to_string()),
    }
}

impl serde::Serialize for Node {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_export_json().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Node {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Node::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;
    use serde_json::json;

    #[test]
    fn objects_become_children() {
        let node = Node::from_json(&json!({"a": 1, "b": {"c": "x"}, "gone": null})).unwrap();
        assert_eq!(node.child_count(), 2);
        assert_eq!(node.child(&Path::parse("b/c").unwrap()), Node::from("x"));
        assert_eq!(node.to_json(), json!({"a": 1, "b": {"c": "x"}}));
    }

    #[test]
    fn priorities_survive_export() {
        let raw = json!({".priority": 5, "a": {".value": true, ".priority": "p"}});
        let node = Node::from_json(&raw).unwrap();
        assert_eq!(node.priority(), &Priority::Number(Number::new(5.0)));
        assert_eq!(node.to_export_json(), raw);
        assert_eq!(node.to_json(), json!({"a": true}));
    }

    #[test]
    fn dense_integer_keys_export_as_arrays() {
        let node = Node::from_json(&json!(["a", "b", null, "d"])).unwrap();
        assert_eq!(node.child_count(), 3);
        assert_eq!(node.to_json(), json!(["a", "b", null, "d"]));

        let sparse = Node::from_json(&json!({"0": 1, "9": 2})).unwrap();
        assert_eq!(sparse.to_json(), json!({"0": 1, "9": 2}));
    }

    #[test]
    fn invalid_priority_is_rejected() {
        let err = Node::from_json(&json!({".priority": true, "a": 1})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPriority { .. }));
    }

    #[test]
    fn value_wrapper_must_be_scalar() {
        assert!(Node::from_json(&json!({".value": {"a": 1}})).is_err());
    }

    #[test]
    fn floats_and_integers() {
        let node = Node::from_json(&json!({"i": 3, "f": 1.5})).unwrap();
        assert_eq!(node.to_json(), json!({"i": 3, "f": 1.5}));
    }

    #[test]
    fn serde_roundtrip_keeps_priority() {
        let node = Node::from_json(&json!({"a": {".value": 1, ".priority": 2}})).unwrap();
        let text = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&text).unwrap();
        assert_eq!(back, node);
    }
}
