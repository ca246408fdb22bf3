//! Outbound notifications for UI and other observers.
//!
//! Every subscriber gets every event published after it subscribed. A slow
//! subscriber that falls more than the channel capacity behind observes a
//! `Lagged` error from the receiver and continues with newer events.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::{ChangeId, NetworkStatus, PendingChange, SyncConflict};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Item currently being applied, as reported in progress events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressItem {
    pub change_id: ChangeId,
    pub entity_type: String,
    pub entity_id: String,
    pub label: String,
}

impl From<&PendingChange> for ProgressItem {
    fn from(change: &PendingChange) -> Self {
        Self {
            change_id: change.id,
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            label: change.display_label(),
        }
    }
}

/// Counters reported at the end of a processor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Run completion time (Unix ms)
    pub completed_at: i64,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Changes skipped because their backoff delay had not elapsed
    pub deferred: usize,
    /// Pending or failed changes left after the run (conflicted excluded)
    pub remaining: usize,
}

impl SyncReport {
    pub const fn is_clean(&self) -> bool {
        self.remaining == 0
    }
}

/// Events published by the sync core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    NetworkStatusChanged(NetworkStatus),
    SyncProgress {
        queue_length: usize,
        current: Option<ProgressItem>,
    },
    ConflictDetected(Box<SyncConflict>),
    SyncCompleted(SyncReport),
    /// A change exceeded its retry budget or was rejected by the server
    ChangeFailed {
        change_id: ChangeId,
        retry_count: u32,
        error: String,
    },
    /// Local state should be replaced by this server snapshot
    ServerVersionAccepted {
        entity_type: String,
        entity_id: String,
        version: Option<i64>,
        snapshot: Value,
    },
}

/// Broadcast channel for `SyncEvent`s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; having none is not an error.
    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Sync event dropped, no subscribers");
        }
    }
}
