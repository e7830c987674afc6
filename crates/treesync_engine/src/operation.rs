//! Operations applied to the sync tree.

use treesync_core::{ChildKey, CompoundWrite, ImmutableTree, Node, Path, QueryParams};

/// Where an operation came from.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationSource {
    /// A local write or its acknowledgement.
    User,
    /// An untagged server update, applied to every query it touches.
    Server,
    /// A server update routed to the query with these parameters.
    TaggedServer(QueryParams),
}

impl OperationSource {
    /// True for local writes.
    pub fn is_from_user(&self) -> bool {
        matches!(self, Self::User)
    }

    /// True for server updates, tagged or not.
    pub fn is_from_server(&self) -> bool {
        !self.is_from_user()
    }

    /// True for server updates addressed to a single query.
    pub fn is_tagged(&self) -> bool {
        matches!(self, Self::TaggedServer(_))
    }

    /// The parameters of the addressed query, for tagged updates.
    pub fn query_params(&self) -> Option<&QueryParams> {
        match self {
            Self::TaggedServer(params) => Some(params),
            Self::User | Self::Server => None,
        }
    }
}

/// A change fed into the sync tree.
///
/// Paths are relative to the sync point the operation is currently being
/// applied to; [`Operation::operation_for_child`] rebases an operation one
/// level down.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Replaces everything at `path`.
    Overwrite {
        /// Origin of the change.
        source: OperationSource,
        /// Location of the change.
        path: Path,
        /// The new value.
        snapshot: Node,
    },
    /// Replaces several descendants of `path`.
    Merge {
        /// Origin of the change.
        source: OperationSource,
        /// Location of the change.
        path: Path,
        /// The replaced descendants, relative to `path`.
        children: CompoundWrite,
    },
    /// A local write was acknowledged or reverted.
    AckUserWrite {
        /// Location of the write.
        path: Path,
        /// Locations the write touched, relative to `path`.
        affected_tree: ImmutableTree<bool>,
        /// True if the server rejected the write.
        revert: bool,
    },
    /// A listen has delivered its complete initial data.
    ListenComplete {
        /// Origin of the completion.
        source: OperationSource,
        /// Listened location.
        path: Path,
    },
}

impl Operation {
    /// Where the operation came from.
    pub fn source(&self) -> &OperationSource {
        static USER: OperationSource = OperationSource::User;
        match self {
            Self::Overwrite { source, .. }
            | Self::Merge { source, .. }
            | Self::ListenComplete { source, .. } => source,
            Self::AckUserWrite { .. } => &USER,
        }
    }

    /// The location of the operation, relative to where it is applied.
    pub fn path(&self) -> &Path {
        match self {
            Self::Overwrite { path, .. }
            | Self::Merge { path, .. }
            | Self::AckUserWrite { path, .. }
            | Self::ListenComplete { path, .. } => path,
        }
    }

    /// The same operation as seen from the child `key`, or `None` if the
    /// operation does not reach that child.
    ///
    /// # Panics
    ///
    /// Panics if an acknowledgement is rebased onto a child that is not on
    /// its path.
    #[must_use]
    pub fn operation_for_child(&self, key: &ChildKey) -> Option<Operation> {
        match self {
            Self::Overwrite {
                source,
                path,
                snapshot,
            } => {
                if path.is_empty() {
                    Some(Self::Overwrite {
                        source: source.clone(),
                        path: Path::empty(),
                        snapshot: snapshot.immediate_child(key),
                    })
                } else if path.front() == Some(key) {
                    Some(Self::Overwrite {
                        source: source.clone(),
                        path: path.pop_front(),
                        snapshot: snapshot.clone(),
                    })
                } else {
                    None
                }
            }
            Self::Merge {
                source,
                path,
                children,
            } => {
                if path.is_empty() {
                    let child_tree = children.child_compound_write(&Path::from_key(key.clone()));
                    if child_tree.is_empty() {
                        None
                    } else if let Some(node) = child_tree.root_write() {
                        // The child is completely replaced.
                        Some(Self::Overwrite {
                            source: source.clone(),
                            path: Path::empty(),
                            snapshot: node.clone(),
                        })
                    } else {
                        Some(Self::Merge {
                            source: source.clone(),
                            path: Path::empty(),
                            children: child_tree,
                        })
                    }
                } else if path.front() == Some(key) {
                    Some(Self::Merge {
                        source: source.clone(),
                        path: path.pop_front(),
                        children: children.clone(),
                    })
                } else {
                    None
                }
            }
            Self::AckUserWrite {
                path,
                affected_tree,
                revert,
            } => {
                if !path.is_empty() {
                    assert!(
                        path.front() == Some(key),
                        "operation_for_child called for an unrelated child"
                    );
                    Some(Self::AckUserWrite {
                        path: path.pop_front(),
                        affected_tree: affected_tree.clone(),
                        revert: *revert,
                    })
                } else if affected_tree.value().is_some() {
                    assert!(
                        affected_tree.children().next().is_none(),
                        "affected tree should not have overlapping affected paths"
                    );
                    // The whole location was written, so every child is affected.
                    Some(self.clone())
                } else {
                    let child_tree = affected_tree.subtree(&Path::from_key(key.clone()));
                    Some(Self::AckUserWrite {
                        path: Path::empty(),
                        affected_tree: child_tree,
                        revert: *revert,
                    })
                }
            }
            Self::ListenComplete { source, path } => {
                if path.is_empty() {
                    Some(Self::ListenComplete {
                        source: source.clone(),
                        path: Path::empty(),
                    })
                } else if path.front() == Some(key) {
                    Some(Self::ListenComplete {
                        source: source.clone(),
                        path: path.pop_front(),
                    })
                } else {
                    None
                }
            }
        }
    }
}
