//! tasksync-core - offline synchronization core for tasksync
//!
//! This crate holds the durable pending-change queue, the sync processor that
//! replays it against the server, connectivity monitoring, conflict
//! detection and resolution, and the debounced activity log writer. Front
//! ends talk to it through [`SyncEngine`] or the individual services.

pub mod clock;
pub mod coalescer;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use events::{SyncEvent, SyncReport};
pub use models::{ChangeId, ConflictId, NewChange, PendingChange, SyncConflict};
