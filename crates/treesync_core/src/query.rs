//! Query parameters and query identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::index::{Index, NamedNode};
use crate::key::ChildKey;
use crate::node::Node;
use crate::path::Path;

/// Which end of the range a limited query keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewFrom {
    /// Keep the first children (`limit_to_first`).
    Left,
    /// Keep the last children (`limit_to_last`).
    Right,
}

/// One end of a range query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bound {
    value: Node,
    name: Option<ChildKey>,
}

impl Bound {
    /// The indexed value at the boundary.
    #[must_use]
    pub fn value(&self) -> &Node {
        &self.value
    }

    /// The key used to break ties at the boundary, if given.
    #[must_use]
    pub fn name(&self) -> Option<&ChildKey> {
        self.name.as_ref()
    }
}

/// Ordering, range and limit applied to a location.
///
/// The default value loads all data at the location under the priority
/// index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Map<String, Value>", try_from = "Map<String, Value>")]
pub struct QueryParams {
    limit: Option<u32>,
    view_from: Option<ViewFrom>,
    start: Option<Bound>,
    end: Option<Bound>,
    index: Index,
}

impl QueryParams {
    /// Parameters that load everything under the default index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders children by `index`.
    #[must_use]
    pub fn order_by(mut self, index: Index) -> Self {
        self.index = index;
        self
    }

    /// Starts the range at `value` (and `name` to break ties).
    #[must_use]
    pub fn start_at(mut self, value: Node, name: Option<ChildKey>) -> Self {
        self.start = Some(Bound { value, name });
        self
    }

    /// Ends the range at `value` (and `name` to break ties).
    #[must_use]
    pub fn end_at(mut self, value: Node, name: Option<ChildKey>) -> Self {
        self.end = Some(Bound { value, name });
        self
    }

    /// Keeps only the first `limit` children.
    #[must_use]
    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.view_from = Some(ViewFrom::Left);
        self
    }

    /// Keeps only the last `limit` children.
    #[must_use]
    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.view_from = Some(ViewFrom::Right);
        self
    }

    /// The ordering index.
    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The limit, if any.
    #[must_use]
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// The start bound, if any.
    #[must_use]
    pub fn start(&self) -> Option<&Bound> {
        self.start.as_ref()
    }

    /// The end bound, if any.
    #[must_use]
    pub fn end(&self) -> Option<&Bound> {
        self.end.as_ref()
    }

    /// True if a limited query keeps the first children.
    #[must_use]
    pub fn is_view_from_left(&self) -> bool {
        match self.view_from {
            Some(view_from) => view_from == ViewFrom::Left,
            None => self.start.is_some(),
        }
    }

    /// True if the query returns every child at its location, whatever the
    /// ordering.
    #[must_use]
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// True if the query is the plain, unordered "everything" query.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.index == Index::Priority
    }

    /// True if any filtering applies.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        !self.loads_all_data()
    }

    /// The boundary child at the start of the range.
    #[must_use]
    pub fn start_post(&self) -> Option<NamedNode> {
        self.start.as_ref().map(|bound| {
            let name = bound.name.clone().unwrap_or_else(ChildKey::min);
            self.index.make_post(name, &bound.value)
        })
    }

    /// The boundary child at the end of the range.
    #[must_use]
    pub fn end_post(&self) -> Option<NamedNode> {
        self.end.as_ref().map(|bound| {
            let name = bound.name.clone().unwrap_or_else(ChildKey::max);
            self.index.make_post(name, &bound.value)
        })
    }

    /// The parameters in wire form (`sp`, `sn`, `ep`, `en`, `l`, `vf`, `i`).
    #[must_use]
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(start) = &self.start {
            map.insert("sp".into(), start.value.to_json());
            if let Some(name) = &start.name {
                map.insert("sn".into(), Value::String(name.as_str().to_string()));
            }
        }
        if let Some(end) = &self.end {
            map.insert("ep".into(), end.value.to_json());
            if let Some(name) = &end.name {
                map.insert("en".into(), Value::String(name.as_str().to_string()));
            }
        }
        if let Some(limit) = self.limit {
            map.insert("l".into(), Value::from(limit));
            let view_from = if self.is_view_from_left() { "l" } else { "r" };
            map.insert("vf".into(), Value::String(view_from.into()));
        }
        if self.index != Index::Priority {
            map.insert("i".into(), Value::String(self.index.query_definition()));
        }
        map
    }

    /// Parses the wire form produced by [`QueryParams::to_wire`].
    ///
    /// # Errors
    ///
    /// Returns an error for malformed fields.
    pub fn from_wire(map: &Map<String, Value>) -> CoreResult<Self> {
        let name_field = |field: &str| -> CoreResult<Option<ChildKey>> {
            match map.get(field) {
                None => Ok(None),
                Some(Value::String(s)) => Ok(Some(ChildKey::new(s))),
                Some(other) => Err(CoreError::invalid_query(format!(
                    "'{field}' must be a string, got {other}"
                ))),
            }
        };
        let mut params = QueryParams::new();
        if let Some(start) = map.get("sp") {
            params.start = Some(Bound {
                value: Node::from_json(start)?,
                name: name_field("sn")?,
            });
        }
        if let Some(end) = map.get("ep") {
            params.end = Some(Bound {
                value: Node::from_json(end)?,
                name: name_field("en")?,
            });
        }
        if let Some(limit) = map.get("l") {
            let limit = limit
                .as_u64()
                .and_then(|l| u32::try_from(l).ok())
                .ok_or_else(|| CoreError::invalid_query(format!("bad limit {limit}")))?;
            params.limit = Some(limit);
            params.view_from = match map.get("vf").and_then(Value::as_str) {
                Some("r") => Some(ViewFrom::Right),
                Some("l") | None => Some(ViewFrom::Left),
                Some(other) => {
                    return Err(CoreError::invalid_query(format!("bad view direction '{other}'")))
                }
            };
        }
        if let Some(index) = map.get("i") {
            let definition = index
                .as_str()
                .ok_or_else(|| CoreError::invalid_query("index must be a string"))?;
            params.index = Index::from_query_definition(definition)?;
        }
        Ok(params)
    }
}

impl From<QueryParams> for Map<String, Value> {
    fn from(params: QueryParams) -> Self {
        params.to_wire()
    }
}

impl TryFrom<Map<String, Value>> for QueryParams {
    type Error = CoreError;

    fn try_from(map: Map<String, Value>) -> CoreResult<Self> {
        Self::from_wire(&map)
    }
}

/// A listened location together with its query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    path: Path,
    params: QueryParams,
}

impl QuerySpec {
    /// Builds a query.
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    /// The default query at `path`.
    pub fn default_at(path: Path) -> Self {
        Self::new(path, QueryParams::default())
    }

    /// The queried location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The query parameters.
    #[must_use]
    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// The ordering index.
    #[must_use]
    pub fn index(&self) -> &Index {
        self.params.index()
    }

    /// See [`QueryParams::loads_all_data`].
    #[must_use]
    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    /// See [`QueryParams::is_default`].
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, Value::Object(self.params.to_wire()))
    }
}
