//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{ChangeId, EntityKey};
use crate::error::Error;

/// Field name reported when the two sides cannot be compared field by field
/// (e.g. a local delete against a server update).
pub const WHOLE_ENTITY_FIELD: &str = "*";

/// Conflict row identifier (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    /// Hidden by the user without resolving; the change stays un-synced
    Dismissed,
}

impl ConflictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(Error::Database(format!("unknown conflict status '{other}'"))),
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepServer,
    Merged,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(Self::KeepLocal),
            "keep_server" | "server" => Ok(Self::KeepServer),
            "merged" | "merge" => Ok(Self::Merged),
            other => Err(Error::validation(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Divergence between the local and server versions of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    /// Pending change whose remote apply was rejected
    pub change_id: ChangeId,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_label: String,
    /// Local snapshot that failed to apply
    pub local_version: Value,
    /// Server snapshot returned with the rejection
    pub server_version: Value,
    /// Server version number, when the remote reported one
    pub server_version_number: Option<i64>,
    /// Fields changed on both sides, sorted
    pub conflict_fields: Vec<String>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub status: ConflictStatus,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Pending and dismissed conflicts still need a human decision.
    pub const fn is_open(&self) -> bool {
        matches!(
            self.status,
            ConflictStatus::Pending | ConflictStatus::Dismissed
        )
    }
}

/// Append-only record of a resolved conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: ConflictId,
    pub resolution: Resolution,
    pub merged_data: Option<Value>,
    /// Unix ms
    pub resolved_at: i64,
    pub resolved_by: String,
}
