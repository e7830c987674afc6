//! Lookups of children a filter needs but the view does not hold.

use treesync_core::{CacheNode, ChildKey, Index, IndexedNode, NamedNode, Node};

use super::cache::ViewCache;
use crate::write_tree::WriteTreeRef;

/// Supplies complete children from outside a view's own caches.
///
/// A limited view uses this to pull in the next child when one of its
/// children leaves the window.
pub(crate) trait CompleteChildSource {
    /// The complete value of `key`, if known.
    fn complete_child(&self, key: &ChildKey) -> Option<Node>;

    /// The child ordered right after `child` (right before it when
    /// `reverse`), if it can be determined.
    fn child_after_child(&self, index: &Index, child: &NamedNode, reverse: bool) -> Option<NamedNode>;
}

/// A source that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NoCompleteChildSource;

impl CompleteChildSource for NoCompleteChildSource {
    fn complete_child(&self, _key: &ChildKey) -> Option<Node> {
        None
    }

    fn child_after_child(&self, _index: &Index, _child: &NamedNode, _reverse: bool) -> Option<NamedNode> {
        None
    }
}

/// Answers from the event cache first, then from the server cache with
/// pending writes layered on top.
pub(crate) struct WriteTreeCompleteChildSource<'a> {
    writes: WriteTreeRef<'a>,
    view_cache: &'a ViewCache,
    complete_server_cache: Option<&'a Node>,
}

impl<'a> WriteTreeCompleteChildSource<'a> {
    pub(crate) fn new(
        writes: WriteTreeRef<'a>,
        view_cache: &'a ViewCache,
        complete_server_cache: Option<&'a Node>,
    ) -> Self {
        Self {
            writes,
            view_cache,
            complete_server_cache,
        }
    }
}

impl CompleteChildSource for WriteTreeCompleteChildSource<'_> {
    fn complete_child(&self, key: &ChildKey) -> Option<Node> {
        let event_cache = self.view_cache.event_cache();
        if event_cache.is_complete_for_child(key) {
            return Some(event_cache.node().immediate_child(key));
        }
        match self.complete_server_cache {
            Some(server) => {
                let server_cache = CacheNode::new(IndexedNode::new(server.clone(), Index::Key), true, false);
                self.writes.calc_complete_child(key, &server_cache)
            }
            None => self
                .writes
                .calc_complete_child(key, self.view_cache.server_cache()),
        }
    }

    fn child_after_child(&self, index: &Index, child: &NamedNode, reverse: bool) -> Option<NamedNode> {
        let server = self
            .complete_server_cache
            .or_else(|| self.view_cache.complete_server_snap());
        self.writes.calc_next_node_after_post(server, child, reverse, index)
    }
}
