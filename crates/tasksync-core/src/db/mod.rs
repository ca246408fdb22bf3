//! Database layer for tasksync

mod activity_repository;
mod conflict_repository;
mod connection;
mod migrations;
mod pending_repository;
mod state_repository;
mod version_repository;

pub use activity_repository::{ActivityRepository, LibSqlActivityRepository};
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub(crate) use connection::in_transaction;
pub use connection::{Database, SharedDatabase};
pub use pending_repository::{LibSqlPendingChangeRepository, PendingChangeRepository};
pub use state_repository::{LibSqlSyncStateRepository, SyncStateRepository, SyncStateSnapshot};
pub use version_repository::{EntityVersion, EntityVersionRepository, LibSqlEntityVersionRepository};
