//! The connection-facing side of the sync tree.

use std::fmt;

use treesync_core::{QuerySpec, Tag};

/// Opens and closes server listens on behalf of the sync tree.
///
/// Completion is reported back through
/// [`SyncTree::on_listen_complete`](crate::SyncTree::on_listen_complete).
pub trait ListenProvider: Send + Sync + fmt::Debug {
    /// Starts a listen. `tag` is set for filtered queries; `hash` is the
    /// content hash of the data already cached for the query.
    fn start_listening(&self, query: &QuerySpec, tag: Option<Tag>, hash: &str);

    /// Stops a listen started with the same query and tag.
    fn stop_listening(&self, query: &QuerySpec, tag: Option<Tag>);
}

/// A provider for trees that never talk to a server.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineListenProvider;

impl ListenProvider for OfflineListenProvider {
    fn start_listening(&self, _query: &QuerySpec, _tag: Option<Tag>, _hash: &str) {}

    fn stop_listening(&self, _query: &QuerySpec, _tag: Option<Tag>) {}
}
