//! # Treesync Core
//!
//! Value types shared by every treesync crate.
//!
//! This crate provides:
//! - Tree values ([`Node`]) with priorities and JSON import/export
//! - Locations ([`Path`], [`ChildKey`]) and child orderings ([`Index`])
//! - Query parameters and query identities ([`QueryParams`], [`QuerySpec`])
//! - Sparse write overlays ([`CompoundWrite`]) over a persistent path tree
//! - Pending write records, cache snapshots, clocks and push ids
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use treesync_core::{CompoundWrite, Node, Path};
//!
//! let write = CompoundWrite::empty()
//!     .add_write(&Path::parse("foo/bar").unwrap(), Node::from("X"))
//!     .add_write(&Path::parse("foo").unwrap(), Node::from_json(&json!({"bar": "Y"})).unwrap());
//! assert_eq!(write.apply(&Node::empty()).to_json(), json!({"foo": {"bar": "Y"}}));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache_node;
mod clock;
mod compound_write;
mod error;
mod immutable_tree;
mod index;
mod indexed_node;
mod key;
mod node;
mod path;
mod push_id;
mod query;
mod types;
mod user_write;

pub use cache_node::CacheNode;
pub use clock::{Clock, ManualClock, OffsetClock, SystemClock};
pub use compound_write::CompoundWrite;
pub use error::{CoreError, CoreResult};
pub use immutable_tree::ImmutableTree;
pub use index::{Index, NamedNode};
pub use indexed_node::IndexedNode;
pub use key::ChildKey;
pub use node::{LeafValue, Node, Number, Priority};
pub use path::Path;
pub use push_id::PushIdGenerator;
pub use query::{Bound, QueryParams, QuerySpec, ViewFrom};
pub use types::{Tag, WriteId};
pub use user_write::{StoredUserWrite, UserWrite, UserWriteRecord};
