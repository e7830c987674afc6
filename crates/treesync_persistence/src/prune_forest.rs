//! Prune and keep markers over cached paths.

use std::collections::BTreeSet;

use treesync_core::{ChildKey, ImmutableTree, Path};

use crate::error::{PersistenceError, PersistenceResult};

const PRUNE: bool = true;
const KEEP: bool = false;

/// Marks which cached paths may be evicted.
///
/// Each path is pruned, kept or unset. The deepest marker on the way to a
/// path decides its fate, so a keep below a prune survives the prune.
/// Pruning at or below an existing keep is rejected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PruneForest {
    forest: ImmutableTree<bool>,
}

impl PruneForest {
    /// A forest with no markers.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if some path is marked for pruning.
    #[must_use]
    pub fn prunes_anything(&self) -> bool {
        self.forest.contains_matching_value(&|prune: &bool| *prune)
    }

    /// True if `path` lies under a prune marker with no keep below it.
    #[must_use]
    pub fn should_prune_unkept_descendants(&self, path: &Path) -> bool {
        self.forest.leaf_most_value(path) == Some(&PRUNE)
    }

    /// True if `path` lies under a keep marker with no prune below it.
    #[must_use]
    pub fn should_keep(&self, path: &Path) -> bool {
        self.forest.leaf_most_value(path) == Some(&KEEP)
    }

    /// True if applying this forest could change anything at or below
    /// `path`.
    #[must_use]
    pub fn affects_path(&self, path: &Path) -> bool {
        self.forest.root_most_value(path).is_some() || !self.forest.subtree(path).is_empty()
    }

    /// The forest seen from the child `key`, inheriting this node's marker.
    #[must_use]
    pub fn child(&self, key: &ChildKey) -> PruneForest {
        let inherited = self.forest.value().copied();
        let forest = match self.forest.child(key) {
            None => inherited.map_or_else(ImmutableTree::empty, ImmutableTree::leaf),
            Some(child) => match (child.value(), inherited) {
                (None, Some(value)) => child.set(&Path::empty(), value),
                _ => child.clone(),
            },
        };
        PruneForest { forest }
    }

    /// The forest seen from `path`.
    #[must_use]
    pub fn child_at(&self, path: &Path) -> PruneForest {
        path.iter().fold(self.clone(), |forest, key| forest.child(key))
    }

    /// Marks `path` for pruning.
    ///
    /// Keep markers below `path` stay in place and win over the prune.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::PruneConflict`] if `path` is at or below
    /// a keep marker.
    pub fn prune(&self, path: &Path) -> PersistenceResult<PruneForest> {
        if self.forest.root_most_value_matching(path, |v| *v == KEEP).is_some() {
            return Err(PersistenceError::prune_conflict(path.to_string()));
        }
        if self.forest.root_most_value_matching(path, |v| *v == PRUNE).is_some() {
            return Ok(self.clone());
        }
        Ok(PruneForest {
            forest: self.forest.set(path, PRUNE),
        })
    }

    /// Marks every `keys` child of `path` for pruning.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::PruneConflict`] if `path` is at or below
    /// a keep marker.
    pub fn prune_all(&self, path: &Path, keys: &BTreeSet<ChildKey>) -> PersistenceResult<PruneForest> {
        keys.iter()
            .try_fold(self.clone(), |forest, key| forest.prune(&path.child(key)))
    }

    /// Marks `path` and everything below it to be kept.
    #[must_use]
    pub fn keep(&self, path: &Path) -> PruneForest {
        if self.forest.root_most_value_matching(path, |v| *v == KEEP).is_some() {
            return self.clone();
        }
        PruneForest {
            forest: self.forest.set_tree(path, ImmutableTree::leaf(KEEP)),
        }
    }

    /// Marks every `keys` child of `path` to be kept.
    #[must_use]
    pub fn keep_all(&self, path: &Path, keys: &BTreeSet<ChildKey>) -> PruneForest {
        keys.iter()
            .fold(self.clone(), |forest, key| forest.keep(&path.child(key)))
    }

    /// Folds over every explicitly kept path.
    pub fn fold_kept_nodes<A>(&self, init: A, mut visit: impl FnMut(&Path, A) -> A) -> A {
        self.forest.fold(init, |path, prune, acc| {
            if *prune {
                acc
            } else {
                visit(path, acc)
            }
        })
    }
}
