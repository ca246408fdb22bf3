//! Network status model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state connectivity as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    #[default]
    Offline,
    /// Contact with the server was lost recently and probes keep running
    Reconnecting,
}

impl ConnectivityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known connectivity, recomputed on every check and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkStatus {
    pub state: ConnectivityState,
    pub server_reachable: bool,
    /// Time of the check that produced this status (Unix ms), 0 before the first check
    pub last_checked_at: i64,
}

impl NetworkStatus {
    /// Whether the sync processor may drain the queue.
    pub const fn can_sync(&self) -> bool {
        matches!(self.state, ConnectivityState::Online) && self.server_reachable
    }

    /// Two statuses describe the same transition target when state and reachability agree.
    pub fn same_state(&self, other: &Self) -> bool {
        self.state == other.state && self.server_reachable == other.server_reachable
    }
}
