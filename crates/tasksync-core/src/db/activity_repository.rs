//! Activity log repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::Connection;

use crate::error::Result;
use crate::models::ActivityEntry;
use crate::util::{column_integer, column_text, integer_or_null, text_or_null};

/// Trait for activity log storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ActivityRepository {
    /// Insert every entry in one transaction
    async fn insert_batch(&self, entries: &[ActivityEntry]) -> Result<()>;

    /// Entries for a task in insertion order, at most `limit`
    async fn list_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<ActivityEntry>>;
}

/// libSQL implementation of `ActivityRepository`
pub struct LibSqlActivityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlActivityRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn insert_one(&self, entry: &ActivityEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO activity_log
                    (task_id, kind, summary, details, duration_ms, occurred_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                vec![
                    libsql::Value::Text(entry.task_id.clone()),
                    libsql::Value::Text(entry.kind.clone()),
                    libsql::Value::Text(entry.summary.clone()),
                    text_or_null(entry.details.clone()),
                    integer_or_null(entry.duration_ms),
                    libsql::Value::Integer(entry.occurred_at),
                ],
            )
            .await?;
        Ok(())
    }
}

impl ActivityRepository for LibSqlActivityRepository<'_> {
    async fn insert_batch(&self, entries: &[ActivityEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        for entry in entries {
            if let Err(e) = self.insert_one(entry).await {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e);
            }
        }

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn list_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id, kind, summary, details, duration_ms, occurred_at
                 FROM activity_log
                 WHERE task_id = ?
                 ORDER BY id ASC
                 LIMIT ?",
                libsql::params![task_id, limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(ActivityEntry {
                task_id: row.get(0)?,
                kind: row.get(1)?,
                summary: row.get(2)?,
                details: column_text(&row, 3)?,
                duration_ms: column_integer(&row, 4)?,
                occurred_at: row.get(5)?,
            });
        }
        Ok(entries)
    }
}
