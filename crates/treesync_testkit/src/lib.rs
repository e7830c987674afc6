//! # Treesync Testkit
//!
//! Test utilities for treesync.
//!
//! This crate provides:
//! - A sync tree harness with a manual clock and recorded listens
//! - Listeners that record every event they receive
//! - Property-based test generators using proptest
//! - Replay helpers for checking operation ordering end to end
//!
//! ## Usage
//!
//! ```rust,ignore
//! use treesync_testkit::prelude::*;
//!
//! #[test]
//! fn server_data_reaches_listeners() {
//!     let mut tree = TestTree::memory();
//!     let listener = RecordingListener::new();
//!     tree.listen_value(QuerySpec::default_at(path("rooms")), &listener);
//!     tree.server_set("rooms", json!({"lobby": true}));
//!     assert_eq!(listener.last_value(), Some(json!({"lobby": true})));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
