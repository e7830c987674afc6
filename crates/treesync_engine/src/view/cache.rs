//! The pair of caches kept by every view.

use treesync_core::{CacheNode, IndexedNode, Node};

/// What a view shows (event cache) next to what the server last said
/// (server cache).
///
/// The event cache is the server cache with pending writes applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ViewCache {
    event_cache: CacheNode,
    server_cache: CacheNode,
}

impl ViewCache {
    pub(crate) fn new(event_cache: CacheNode, server_cache: CacheNode) -> Self {
        Self {
            event_cache,
            server_cache,
        }
    }

    #[must_use]
    pub(crate) fn update_event_snap(&self, snap: IndexedNode, complete: bool, filtered: bool) -> Self {
        Self::new(CacheNode::new(snap, complete, filtered), self.server_cache.clone())
    }

    #[must_use]
    pub(crate) fn update_server_snap(&self, snap: IndexedNode, complete: bool, filtered: bool) -> Self {
        Self::new(self.event_cache.clone(), CacheNode::new(snap, complete, filtered))
    }

    pub(crate) fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    pub(crate) fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }

    /// The event node, if it is complete.
    pub(crate) fn complete_event_snap(&self) -> Option<&Node> {
        self.event_cache
            .is_fully_initialized()
            .then(|| self.event_cache.node())
    }

    /// The server node, if it is complete.
    pub(crate) fn complete_server_snap(&self) -> Option<&Node> {
        self.server_cache
            .is_fully_initialized()
            .then(|| self.server_cache.node())
    }
}
