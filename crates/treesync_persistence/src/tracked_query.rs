//! Persisted metadata about cached queries.

use serde::{Deserialize, Serialize};
use treesync_core::QuerySpec;

/// Completeness and recency of one cached query.
///
/// Queries that load all data at their location are always tracked as the
/// default query at that location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedQuery {
    /// Storage identifier.
    pub id: u64,
    /// The tracked query.
    pub query: QuerySpec,
    /// Last time the query was used, in milliseconds.
    pub last_use: i64,
    /// True once a listen for the query fully resolved.
    pub complete: bool,
    /// True while the query is listened to.
    pub active: bool,
}

impl TrackedQuery {
    /// Creates a record.
    ///
    /// # Panics
    ///
    /// Panics if `query` loads all data but is not the default query.
    pub fn new(id: u64, query: QuerySpec, last_use: i64, complete: bool, active: bool) -> Self {
        assert_valid_tracked_query(&query);
        Self {
            id,
            query,
            last_use,
            complete,
            active,
        }
    }

    /// Returns a copy with `last_use` updated.
    #[must_use]
    pub fn update_last_use(&self, last_use: i64) -> Self {
        Self {
            last_use,
            ..self.clone()
        }
    }

    /// Returns a copy marked complete.
    #[must_use]
    pub fn set_complete(&self) -> Self {
        Self {
            complete: true,
            ..self.clone()
        }
    }

    /// Returns a copy with the active flag replaced.
    #[must_use]
    pub fn set_active_state(&self, active: bool) -> Self {
        Self {
            active,
            ..self.clone()
        }
    }
}

/// Panics unless `query` may be stored as a tracked query.
pub(crate) fn assert_valid_tracked_query(query: &QuerySpec) {
    assert!(
        !query.loads_all_data() || query.is_default(),
        "can't have tracked non-default query that loads all data: {query}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use treesync_core::{Index, Path, QueryParams};

    #[test]
    fn state_transitions_copy() {
        let query = QuerySpec::default_at(Path::parse("a").unwrap());
        let tracked = TrackedQuery::new(1, query, 10, false, true);
        let updated = tracked.update_last_use(20).set_complete().set_active_state(false);
        assert_eq!(updated.last_use, 20);
        assert!(updated.complete);
        assert!(!updated.active);
        assert!(tracked.active);
    }

    #[test]
    #[should_panic(expected = "non-default query that loads all data")]
    fn rejects_non_default_query_loading_all_data() {
        let query = QuerySpec::new(Path::empty(), QueryParams::new().order_by(Index::Key));
        let _ = TrackedQuery::new(1, query, 0, false, true);
    }

    #[test]
    fn accepts_filtered_queries() {
        let query = QuerySpec::new(Path::empty(), QueryParams::new().limit_to_first(2));
        assert!(!TrackedQuery::new(4, query, 0, true, false).active);
    }
}
