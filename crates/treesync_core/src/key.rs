//! Child keys and their ordering.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

const MIN_NAME: &str = "[MIN_NAME]";
const MAX_NAME: &str = "[MAX_NAME]";
const PRIORITY_NAME: &str = ".priority";
const INFO_NAME: &str = ".info";

/// The name of one child in a tree.
///
/// Keys are ordered the way siblings are listed:
///
/// 1. the `[MIN_NAME]` sentinel
/// 2. keys that parse as 32-bit integers, numerically (ties broken by length)
/// 3. every other key, lexicographically
/// 4. the `[MAX_NAME]` sentinel
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChildKey {
    name: Arc<str>,
    int_value: Option<i32>,
}

impl ChildKey {
    /// Creates a key from a name.
    pub fn new(name: &str) -> Self {
        Self {
            int_value: parse_int(name),
            name: Arc::from(name),
        }
    }

    /// The sentinel key ordered before every other key.
    pub fn min() -> Self {
        Self::new(MIN_NAME)
    }

    /// The sentinel key ordered after every other key.
    pub fn max() -> Self {
        Self::new(MAX_NAME)
    }

    /// The `.priority` pseudo-child.
    pub fn priority() -> Self {
        Self::new(PRIORITY_NAME)
    }

    /// The `.info` namespace key.
    pub fn info() -> Self {
        Self::new(INFO_NAME)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns true for the `.priority` pseudo-child.
    #[must_use]
    pub fn is_priority(&self) -> bool {
        &*self.name == PRIORITY_NAME
    }

    /// Returns true for the minimum sentinel.
    #[must_use]
    pub fn is_min(&self) -> bool {
        &*self.name == MIN_NAME
    }

    /// Returns true for the maximum sentinel.
    #[must_use]
    pub fn is_max(&self) -> bool {
        &*self.name == MAX_NAME
    }

    /// Returns the integer value when the key is integer-like.
    #[must_use]
    pub fn int_value(&self) -> Option<i32> {
        self.int_value
    }
}

/// Parses keys like `"12"` or `"-4"` that fit in an `i32`.
fn parse_int(name: &str) -> Option<i32> {
    if name.is_empty() || name.len() > 11 {
        return None;
    }
    let (negative, digits) = match name.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude: i64 = digits.parse().ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.name == other.name {
            return Ordering::Equal;
        }
        if self.is_min() || other.is_max() {
            return Ordering::Less;
        }
        if other.is_min() || self.is_max() {
            return Ordering::Greater;
        }
        match (self.int_value, other.int_value) {
            (Some(a), Some(b)) => a
                .cmp(&b)
                .then_with(|| self.name.len().cmp(&other.name.len())),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.name.cmp(&other.name),
        }
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChildKey({:?})", &*self.name)
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ChildKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChildKey {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl serde::Serialize for ChildKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> serde::Deserialize<'de> for ChildKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::new(&name))
    }
}
