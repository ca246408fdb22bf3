//! Pending change model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for a pending change, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new unique change ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of mutation recorded locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::validation(format!("unknown operation '{other}'"))),
        }
    }
}

/// Processing state of a stored change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Eligible for automatic processing
    Pending,
    /// Retry ceiling exceeded or rejected by the server; waits for a human
    Failed,
    /// Blocked on an unresolved sync conflict
    Conflicted,
}

impl ChangeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(Error::Database(format!("unknown change status '{other}'"))),
        }
    }
}

/// Identity of a synchronized entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A local mutation not yet confirmed by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub entity_type: String,
    pub entity_id: String,
    /// Human readable name of the entity (e.g. task title)
    pub entity_label: Option<String>,
    pub operation: ChangeOperation,
    /// Full entity snapshot for create/update, `null` for delete
    pub payload: Value,
    /// Server version the mutation was made against
    pub base_version: Option<i64>,
    /// Server snapshot at `base_version`, the common ancestor for conflict detection
    pub base_snapshot: Option<Value>,
    /// Enqueue timestamp (Unix ms)
    pub queued_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: ChangeStatus,
    /// Earliest time (Unix ms) an automatic run may retry this change
    pub next_attempt_at: Option<i64>,
}

impl PendingChange {
    /// Fresh queue row for a mutation, due immediately.
    pub fn from_new(change: NewChange, queued_at: i64) -> Self {
        Self {
            id: ChangeId::new(),
            entity_type: change.entity_type.trim().to_string(),
            entity_id: change.entity_id.trim().to_string(),
            entity_label: change.entity_label,
            operation: change.operation,
            payload: change.payload,
            base_version: change.base_version,
            base_snapshot: change.base_snapshot,
            queued_at,
            retry_count: 0,
            last_error: None,
            status: ChangeStatus::Pending,
            next_attempt_at: None,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Label for UI surfaces, falling back to the entity id.
    pub fn display_label(&self) -> String {
        self.entity_label
            .clone()
            .unwrap_or_else(|| self.entity_id.clone())
    }

    /// Whether an automatic run may attempt this change at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.status == ChangeStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Input for enqueueing a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChange {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub entity_label: Option<String>,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub base_version: Option<i64>,
    #[serde(default)]
    pub base_snapshot: Option<Value>,
}

impl NewChange {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: ChangeOperation,
        payload: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            entity_label: None,
            operation,
            payload,
            base_version: None,
            base_snapshot: None,
        }
    }

    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, entity_id, ChangeOperation::Create, payload)
    }

    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, entity_id, ChangeOperation::Update, payload)
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, ChangeOperation::Delete, Value::Null)
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.entity_label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_base(mut self, version: i64, snapshot: Option<Value>) -> Self {
        self.base_version = Some(version);
        self.base_snapshot = snapshot;
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Reject malformed mutations before they reach the queue.
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(Error::validation("entity type must not be empty"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(Error::validation("entity id must not be empty"));
        }
        match self.operation {
            ChangeOperation::Create | ChangeOperation::Update if !self.payload.is_object() => {
                Err(Error::validation(format!(
                    "{} of {}/{} requires an object payload",
                    self.operation, self.entity_type, self.entity_id
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_id_roundtrips_through_string() {
        let id = ChangeId::new();
        let parsed: ChangeId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn operation_parses_case_insensitively() {
        assert_eq!(
            "Update".parse::<ChangeOperation>().unwrap(),
            ChangeOperation::Update
        );
        assert!("upsert".parse::<ChangeOperation>().is_err());
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let change = NewChange::update("", "t1", json!({"title": "x"}));
        assert!(matches!(change.validate(), Err(Error::Validation(_))));

        let change = NewChange::update("task", "  ", json!({"title": "x"}));
        assert!(matches!(change.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn validate_requires_object_payload_for_writes() {
        assert!(NewChange::create("task", "t1", json!("title"))
            .validate()
            .is_err());
        assert!(NewChange::update("task", "t1", json!({"title": "x"}))
            .validate()
            .is_ok());
        assert!(NewChange::delete("task", "t1").validate().is_ok());
    }

    #[test]
    fn backoff_schedule_controls_due_state() {
        let change = PendingChange {
            id: ChangeId::new(),
            entity_type: "task".to_string(),
            entity_id: "t1".to_string(),
            entity_label: None,
            operation: ChangeOperation::Update,
            payload: json!({}),
            base_version: None,
            base_snapshot: None,
            queued_at: 0,
            retry_count: 1,
            last_error: None,
            status: ChangeStatus::Pending,
            next_attempt_at: Some(1_000),
        };
        assert!(!change.is_due(999));
        assert!(change.is_due(1_000));
        assert_eq!(change.display_label(), "t1");
    }
}
