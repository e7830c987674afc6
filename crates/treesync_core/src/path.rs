//! Locations inside the tree.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::key::ChildKey;

/// An immutable sequence of child keys identifying a location.
///
/// Slicing off the front (`pop_front`) shares the underlying storage, so
/// walking down a path while recursing through a tree does not allocate.
#[derive(Clone)]
pub struct Path {
    pieces: Arc<[ChildKey]>,
    start: usize,
}

impl Path {
    /// The root path.
    pub fn empty() -> Self {
        Self {
            pieces: Arc::from(Vec::new()),
            start: 0,
        }
    }

    /// Parses a slash separated path, ignoring empty segments.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment contains a character that can never
    /// appear in a key (`#`, `$`, `[`, `]`).
    pub fn parse(path: &str) -> CoreResult<Self> {
        let mut pieces = Vec::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if let Some(bad) = segment.chars().find(|c| matches!(c, '#' | '$' | '[' | ']')) {
                return Err(CoreError::invalid_path(
                    path,
                    format!("segment '{segment}' contains '{bad}'"),
                ));
            }
            pieces.push(ChildKey::new(segment));
        }
        Ok(Self::from_keys(pieces))
    }

    /// Builds a path from keys.
    pub fn from_keys(keys: Vec<ChildKey>) -> Self {
        Self {
            pieces: Arc::from(keys),
            start: 0,
        }
    }

    /// Path containing one key.
    pub fn from_key(key: ChildKey) -> Self {
        Self::from_keys(vec![key])
    }

    fn keys(&self) -> &[ChildKey] {
        &self.pieces[self.start..]
    }

    /// Iterates the keys from the root down.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ChildKey> + ExactSizeIterator {
        self.keys().iter()
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pieces.len() - self.start
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First key, if any.
    #[must_use]
    pub fn front(&self) -> Option<&ChildKey> {
        self.keys().first()
    }

    /// Last key, if any.
    #[must_use]
    pub fn back(&self) -> Option<&ChildKey> {
        self.keys().last()
    }

    /// The path without its first key. The root stays the root.
    #[must_use]
    pub fn pop_front(&self) -> Self {
        Self {
            pieces: Arc::clone(&self.pieces),
            start: (self.start + 1).min(self.pieces.len()),
        }
    }

    /// The parent location, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        let keys = self.keys();
        Some(Self::from_keys(keys[..keys.len() - 1].to_vec()))
    }

    /// Appends one key.
    #[must_use]
    pub fn child(&self, key: &ChildKey) -> Self {
        let mut keys = self.keys().to_vec();
        keys.push(key.clone());
        Self::from_keys(keys)
    }

    /// Appends another path.
    #[must_use]
    pub fn join(&self, other: &Path) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut keys = self.keys().to_vec();
        keys.extend(other.iter().cloned());
        Self::from_keys(keys)
    }

    /// True if `self` is an ancestor of, or equal to, `other`.
    #[must_use]
    pub fn contains(&self, other: &Path) -> bool {
        self.len() <= other.len() && self.keys() == &other.keys()[..self.len()]
    }

    /// The path from `ancestor` down to `descendant`.
    ///
    /// # Panics
    ///
    /// Panics if `ancestor` does not contain `descendant`.
    #[must_use]
    pub fn relative(ancestor: &Path, descendant: &Path) -> Path {
        assert!(
            ancestor.contains(descendant),
            "{ancestor} is not an ancestor of {descendant}"
        );
        Self::from_keys(descendant.keys()[ancestor.len()..].to_vec())
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.keys() == other.keys()
    }
}

impl Eq for Path {}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.keys().hash(state);
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keys().cmp(other.keys())
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for Path {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("/");
        }
        for key in self.iter() {
            write!(f, "/{key}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl From<ChildKey> for Path {
    fn from(key: ChildKey) -> Self {
        Self::from_key(key)
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a ChildKey;
    type IntoIter = std::slice::Iter<'a, ChildKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys().iter()
    }
}

impl serde::Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Path {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn parse_skips_empty_segments() {
        let path = p("//a/b//c/");
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "/a/b/c");
        assert_eq!(p("").to_string(), "/");
    }

    #[test]
    fn parse_rejects_illegal_characters() {
        assert!(Path::parse("/a/b$c").is_err());
        assert!(Path::parse("/a[0]").is_err());
    }

    #[test]
    fn front_back_and_pop() {
        let path = p("a/b/c");
        assert_eq!(path.front().unwrap().as_str(), "a");
        assert_eq!(path.back().unwrap().as_str(), "c");
        let rest = path.pop_front();
        assert_eq!(rest, p("b/c"));
        assert_eq!(rest.pop_front().pop_front(), Path::empty());
        assert_eq!(Path::empty().pop_front(), Path::empty());
    }

    #[test]
    fn parent_and_child() {
        let path = p("a/b");
        assert_eq!(path.parent(), Some(p("a")));
        assert_eq!(Path::empty().parent(), None);
        assert_eq!(path.child(&ChildKey::new("c")), p("a/b/c"));
        assert_eq!(p("a").join(&p("b/c")), p("a/b/c"));
    }

    #[test]
    fn containment_is_ancestor_or_self() {
        assert!(p("a").contains(&p("a/b")));
        assert!(p("a/b").contains(&p("a/b")));
        assert!(Path::empty().contains(&p("x")));
        assert!(!p("a/b").contains(&p("a")));
        assert!(!p("a/b").contains(&p("a/c")));
    }

    #[test]
    fn relative_paths() {
        assert_eq!(Path::relative(&p("a"), &p("a/b/c")), p("b/c"));
        assert_eq!(Path::relative(&p("a/b"), &p("a/b")), Path::empty());
    }

    #[test]
    #[should_panic(expected = "is not an ancestor")]
    fn relative_requires_ancestor() {
        let _ = Path::relative(&p("a/b"), &p("a/c"));
    }

    #[test]
    fn equality_ignores_shared_storage() {
        let popped = p("x/a/b").pop_front();
        assert_eq!(popped, p("a/b"));
        let mut set = std::collections::HashSet::new();
        set.insert(popped);
        assert!(set.contains(&p("a/b")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn keys() -> impl Strategy<Value = Vec<ChildKey>> {
            prop::collection::vec("[a-c]{1,2}".prop_map(|s| ChildKey::new(&s)), 0..4)
        }

        proptest! {
            #[test]
            fn joining_the_relative_path_restores_the_descendant(prefix in keys(), suffix in keys()) {
                let ancestor = Path::from_keys(prefix);
                let descendant = ancestor.join(&Path::from_keys(suffix));
                prop_assert!(ancestor.contains(&descendant));
                prop_assert_eq!(ancestor.join(&Path::relative(&ancestor, &descendant)), descendant);
            }

            #[test]
            fn display_parses_back(segments in keys()) {
                let path = Path::from_keys(segments);
                prop_assert_eq!(Path::parse(&path.to_string()).unwrap(), path);
            }
        }
    }
}
