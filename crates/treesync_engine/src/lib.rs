//! # Treesync Engine
//!
//! The synchronization core of treesync.
//!
//! This crate provides:
//! - [`SyncTree`], which merges server data and pending local writes into
//!   per-query views and derives the events listeners see
//! - The [`WriteTree`] log of unacknowledged local writes
//! - Event registrations, snapshots and an [`EventRaiser`] that isolates
//!   failing listeners
//! - The [`ListenProvider`] seam through which the tree asks a transport to
//!   open and close server listens
//! - Server value (`.sv`) resolution
//!
//! ## Threading
//!
//! A [`SyncTree`] is owned by one task and is not internally locked. Every
//! public operation runs in one persistence transaction and returns the
//! events to raise; raising them is left to the caller.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use treesync_core::{Path, QuerySpec, SystemClock};
//! use treesync_engine::{EngineConfig, EventRaiser, OfflineListenProvider, SyncTree};
//!
//! let mut tree = SyncTree::open(&EngineConfig::new(), Arc::new(OfflineListenProvider), Arc::new(SystemClock))?;
//! let events = tree.apply_server_overwrite(&Path::parse("/users")?, users)?;
//! EventRaiser::new().raise_events(events);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod event;
mod listen;
mod operation;
mod server_values;
mod sync_point;
mod sync_tree;
mod view;
mod write_tree;

pub use config::EngineConfig;
pub use error::{DatabaseError, ListenerError, SyncError, SyncResult};
pub use event::{
    CancelEvent, ChildEventListener, ChildEventRegistration, DataEvent, DataSnapshot, Event, EventRaiser,
    EventRegistration, EventType, ValueEventListener, ValueEventRegistration,
};
pub use listen::{ListenProvider, OfflineListenProvider};
pub use operation::{Operation, OperationSource};
pub use server_values::ServerValues;
pub use sync_tree::{RestoredWrites, SyncTree};
pub use write_tree::{WriteTree, WriteTreeRef};
