//! Data models for tasksync

mod activity;
mod network;
mod pending_change;
mod sync_conflict;

pub use activity::ActivityEntry;
pub use network::{ConnectivityState, NetworkStatus};
pub use pending_change::{
    ChangeId, ChangeOperation, ChangeStatus, EntityKey, NewChange, PendingChange,
};
pub use sync_conflict::{
    ConflictId, ConflictResolution, ConflictStatus, Resolution, SyncConflict, WHOLE_ENTITY_FIELD,
};
