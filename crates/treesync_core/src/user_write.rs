//! Records of local writes awaiting acknowledgement.

use serde::{Deserialize, Serialize};

use crate::compound_write::CompoundWrite;
use crate::node::Node;
use crate::path::Path;
use crate::types::WriteId;

/// The payload of a local write.
#[derive(Debug, Clone, PartialEq)]
pub enum UserWrite {
    /// Replaces the whole subtree at the write's path.
    Overwrite(Node),
    /// Replaces several descendants of the write's path.
    Merge(CompoundWrite),
}

/// One entry of the pending write log.
#[derive(Debug, Clone, PartialEq)]
pub struct UserWriteRecord {
    write_id: WriteId,
    path: Path,
    write: UserWrite,
    visible: bool,
    persist: bool,
}

impl UserWriteRecord {
    /// A visible overwrite.
    pub fn overwrite(write_id: WriteId, path: Path, node: Node, visible: bool) -> Self {
        Self {
            write_id,
            path,
            write: UserWrite::Overwrite(node),
            visible,
            persist: visible,
        }
    }

    /// A merge. Merges are always visible.
    pub fn merge(write_id: WriteId, path: Path, children: CompoundWrite) -> Self {
        Self {
            write_id,
            path,
            write: UserWrite::Merge(children),
            visible: true,
            persist: true,
        }
    }

    /// Marks whether the write is kept in durable storage.
    #[must_use]
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// The write's ID.
    #[must_use]
    pub fn write_id(&self) -> WriteId {
        self.write_id
    }

    /// The written location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The payload.
    #[must_use]
    pub fn write(&self) -> &UserWrite {
        &self.write
    }

    /// True if the write is reflected in events.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// True if the write is kept in durable storage.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persist
    }

    /// True for overwrites.
    #[must_use]
    pub fn is_overwrite(&self) -> bool {
        matches!(self.write, UserWrite::Overwrite(_))
    }

    /// The overwritten node, for overwrites.
    #[must_use]
    pub fn overwrite_node(&self) -> Option<&Node> {
        match &self.write {
            UserWrite::Overwrite(node) => Some(node),
            UserWrite::Merge(_) => None,
        }
    }

    /// The merged children, for merges.
    #[must_use]
    pub fn merge_children(&self) -> Option<&CompoundWrite> {
        match &self.write {
            UserWrite::Overwrite(_) => None,
            UserWrite::Merge(children) => Some(children),
        }
    }

    /// True if this write determines the value at `path`.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        match &self.write {
            UserWrite::Overwrite(_) => self.path.contains(path),
            UserWrite::Merge(children) => children
                .entries()
                .iter()
                .any(|(relative, _)| self.path.join(relative).contains(path)),
        }
    }
}

/// Durable form of a [`UserWriteRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUserWrite {
    /// The write's ID.
    pub id: WriteId,
    /// The written location.
    pub path: Path,
    /// The node for overwrites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<Node>,
    /// The children for merges, keyed by relative path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<Vec<(Path, Node)>>,
}

impl From<&UserWriteRecord> for StoredUserWrite {
    fn from(record: &UserWriteRecord) -> Self {
        match &record.write {
            UserWrite::Overwrite(node) => Self {
                id: record.write_id,
                path: record.path.clone(),
                overwrite: Some(node.clone()),
                merge: None,
            },
            UserWrite::Merge(children) => Self {
                id: record.write_id,
                path: record.path.clone(),
                overwrite: None,
                merge: Some(children.entries()),
            },
        }
    }
}

impl From<StoredUserWrite> for UserWriteRecord {
    fn from(stored: StoredUserWrite) -> Self {
        match (stored.overwrite, stored.merge) {
            (Some(node), _) => UserWriteRecord::overwrite(stored.id, stored.path, node, true),
            (None, merge) => UserWriteRecord::merge(
                stored.id,
                stored.path,
                CompoundWrite::from_path_merge(merge.unwrap_or_default()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn overwrite_covers_descendants() {
        let record = UserWriteRecord::overwrite(WriteId::new(1), p("a"), Node::from(1_i64), true);
        assert!(record.covers(&p("a/b")));
        assert!(!record.covers(&p("b")));
        assert!(record.is_overwrite());
    }

    #[test]
    fn merge_covers_its_children_only() {
        let children = CompoundWrite::from_path_merge(vec![(p("x"), Node::from(1_i64))]);
        let record = UserWriteRecord::merge(WriteId::new(2), p("a"), children);
        assert!(record.covers(&p("a/x/y")));
        assert!(!record.covers(&p("a")));
        assert!(!record.covers(&p("a/z")));
    }

    #[test]
    fn stored_form_roundtrip() {
        let children = CompoundWrite::from_path_merge(vec![
            (p("x"), Node::from(1_i64)),
            (p("y/z"), Node::from_json(&json!({"q": true})).unwrap()),
        ]);
        let record = UserWriteRecord::merge(WriteId::new(3), p("m"), children);
        let text = serde_json::to_string(&StoredUserWrite::from(&record)).unwrap();
        let stored: StoredUserWrite = serde_json::from_str(&text).unwrap();
        assert_eq!(UserWriteRecord::from(stored), record);
    }
}
