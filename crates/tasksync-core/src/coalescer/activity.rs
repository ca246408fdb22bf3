//! Activity log ingestion through the coalescer.

use std::time::Duration;

use crate::clock::SharedClock;
use crate::db::{ActivityRepository, LibSqlActivityRepository, SharedDatabase};
use crate::error::{Error, Result};
use crate::models::ActivityEntry;

use super::{BatchCoalescer, BatchSink, CoalesceError};

/// Writes a task's batch of activity entries in one transaction.
#[derive(Clone)]
pub struct ActivitySink {
    db: SharedDatabase,
}

impl ActivitySink {
    pub const fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

impl BatchSink<String, ActivityEntry> for ActivitySink {
    type Error = Error;

    async fn persist(&self, _task_id: &String, entries: &[ActivityEntry]) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlActivityRepository::new(db.connection())
            .insert_batch(entries)
            .await
    }
}

/// Debounced activity logger keyed by task id
#[derive(Clone)]
pub struct ActivityLogger {
    coalescer: BatchCoalescer<String, ActivityEntry, ActivitySink>,
    db: SharedDatabase,
    clock: SharedClock,
}

impl ActivityLogger {
    pub fn new(db: SharedDatabase, clock: SharedClock, debounce: Duration) -> Self {
        Self {
            coalescer: BatchCoalescer::new(ActivitySink::new(db.clone()), debounce),
            db,
            clock,
        }
    }

    /// Record an activity that happened now.
    pub fn record(
        &self,
        task_id: &str,
        kind: &str,
        summary: &str,
        details: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let mut entry = ActivityEntry::new(task_id, kind, summary, self.clock.now_ms());
        entry.details = details;
        entry.duration_ms = duration_ms;
        self.record_entry(entry)
    }

    pub fn record_entry(&self, entry: ActivityEntry) -> Result<()> {
        if entry.task_id.trim().is_empty() {
            return Err(Error::validation("activity task id must not be empty"));
        }
        if entry.summary.trim().is_empty() {
            return Err(Error::validation("activity summary must not be empty"));
        }
        self.coalescer.record(entry.task_id.clone(), entry);
        Ok(())
    }

    pub async fn flush(&self, task_id: &str) -> Result<usize> {
        self.coalescer
            .flush(&task_id.to_string())
            .await
            .map_err(into_persistence)
    }

    pub async fn flush_all(&self) -> Result<usize> {
        self.coalescer.flush_all().await.map_err(into_persistence)
    }

    /// Stored entries of a task, oldest first. Buffered entries of the task
    /// are flushed first so the result includes them.
    pub async fn list_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.flush(task_id).await?;
        let db = self.db.lock().await;
        LibSqlActivityRepository::new(db.connection())
            .list_for_task(task_id, limit)
            .await
    }

    pub fn pending_len(&self, task_id: &str) -> usize {
        self.coalescer.pending_len(&task_id.to_string())
    }

    pub fn dispose(&self) {
        self.coalescer.dispose();
    }
}

fn into_persistence(error: CoalesceError<String, Error>) -> Error {
    tracing::error!("{error}");
    Error::Persistence(error.to_string())
}
