//! Activity log model

use serde::{Deserialize, Serialize};

/// One high-frequency activity event (automation run, command output, timer tick)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Task the activity belongs to; also the coalescing key
    pub task_id: String,
    /// Activity kind, e.g. `command`, `status_change`
    pub kind: String,
    pub summary: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Unix ms
    pub occurred_at: i64,
}

impl ActivityEntry {
    pub fn new(
        task_id: impl Into<String>,
        kind: impl Into<String>,
        summary: impl Into<String>,
        occurred_at: i64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            kind: kind.into(),
            summary: summary.into(),
            details: None,
            duration_ms: None,
            occurred_at,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
