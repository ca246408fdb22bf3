//! Pending change repository implementation

use std::collections::BTreeMap;

use libsql::{Connection, Row};

use super::in_transaction;
use crate::error::{Error, Result};
use crate::models::{ChangeId, ChangeStatus, EntityKey, PendingChange};
use crate::util::{column_integer, column_text, integer_or_null, text_or_null};

const SELECT_COLUMNS: &str = "id, entity_type, entity_id, entity_label, operation, payload,
    base_version, base_snapshot, queued_at, retry_count, last_error, status, next_attempt_at";

/// Trait for pending change storage operations (async)
#[allow(async_fn_in_trait)]
pub trait PendingChangeRepository {
    /// Append a change at the end of the queue
    async fn insert(&self, change: &PendingChange) -> Result<()>;

    /// Get a change by ID
    async fn get(&self, id: &ChangeId) -> Result<Option<PendingChange>>;

    /// All stored changes in enqueue order
    async fn list(&self) -> Result<Vec<PendingChange>>;

    /// Changes for one entity in enqueue order
    async fn list_for_entity(&self, key: &EntityKey) -> Result<Vec<PendingChange>>;

    /// Remove a change; returns whether a row was deleted
    async fn delete(&self, id: &ChangeId) -> Result<bool>;

    /// Remove every change of an entity; returns the number of rows deleted
    async fn delete_for_entity(&self, key: &EntityKey) -> Result<u64>;

    /// Persist retry bookkeeping for a change
    async fn update_attempt(&self, change: &PendingChange) -> Result<()>;

    /// Set the processing status of a change
    async fn set_status(&self, id: &ChangeId, status: ChangeStatus) -> Result<()>;

    /// Point every change of an entity at a new server base
    async fn rebase_entity(
        &self,
        key: &EntityKey,
        version: Option<i64>,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<u64>;

    /// Swap a change for a new one at the same queue position
    async fn replace(&self, old: &ChangeId, change: &PendingChange) -> Result<()>;

    /// Number of changes per status
    async fn count_by_status(&self) -> Result<BTreeMap<ChangeStatus, usize>>;
}

/// libSQL implementation of `PendingChangeRepository`
pub struct LibSqlPendingChangeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlPendingChangeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a change from a database row
    fn parse_change(row: &Row) -> Result<PendingChange> {
        let id: String = row.get(0)?;
        let operation: String = row.get(4)?;
        let payload: String = row.get(5)?;
        let status: String = row.get(11)?;
        let retry_count: i64 = row.get(9)?;

        Ok(PendingChange {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid change id '{id}'")))?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            entity_label: column_text(row, 3)?,
            operation: operation.parse()?,
            payload: serde_json::from_str(&payload)?,
            base_version: column_integer(row, 6)?,
            base_snapshot: column_text(row, 7)?
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            queued_at: row.get(8)?,
            retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
            last_error: column_text(row, 10)?,
            status: status.parse()?,
            next_attempt_at: column_integer(row, 12)?,
        })
    }

    async fn collect(&self, mut rows: libsql::Rows) -> Result<Vec<PendingChange>> {
        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(Self::parse_change(&row)?);
        }
        Ok(changes)
    }

    fn insert_params(seq: Option<i64>, change: &PendingChange) -> Result<Vec<libsql::Value>> {
        let base_snapshot = change
            .base_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(vec![
            integer_or_null(seq),
            libsql::Value::Text(change.id.as_str()),
            libsql::Value::Text(change.entity_type.clone()),
            libsql::Value::Text(change.entity_id.clone()),
            text_or_null(change.entity_label.clone()),
            libsql::Value::Text(change.operation.as_str().to_string()),
            libsql::Value::Text(serde_json::to_string(&change.payload)?),
            integer_or_null(change.base_version),
            text_or_null(base_snapshot),
            libsql::Value::Integer(change.queued_at),
            libsql::Value::Integer(i64::from(change.retry_count)),
            text_or_null(change.last_error.clone()),
            libsql::Value::Text(change.status.as_str().to_string()),
            integer_or_null(change.next_attempt_at),
        ])
    }

    async fn insert_with_seq(&self, seq: Option<i64>, change: &PendingChange) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pending_changes (
                    seq, id, entity_type, entity_id, entity_label, operation, payload,
                    base_version, base_snapshot, queued_at, retry_count, last_error,
                    status, next_attempt_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                Self::insert_params(seq, change)?,
            )
            .await?;
        Ok(())
    }

    /// Delete `old` and insert `change` under its sequence number. Callers
    /// provide the surrounding transaction.
    pub async fn swap(&self, old: &ChangeId, change: &PendingChange) -> Result<()> {
        let Some(seq) = self.seq_of(old).await? else {
            return Err(Error::NotFound(old.to_string()));
        };
        self.conn
            .execute("DELETE FROM pending_changes WHERE id = ?", [old.as_str()])
            .await?;
        self.insert_with_seq(Some(seq), change).await
    }

    async fn seq_of(&self, id: &ChangeId) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query("SELECT seq FROM pending_changes WHERE id = ?", [id.as_str()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl PendingChangeRepository for LibSqlPendingChangeRepository<'_> {
    async fn insert(&self, change: &PendingChange) -> Result<()> {
        self.insert_with_seq(None, change).await
    }

    async fn get(&self, id: &ChangeId) -> Result<Option<PendingChange>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_changes WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_change(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<PendingChange>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_changes ORDER BY seq ASC"),
                (),
            )
            .await?;
        self.collect(rows).await
    }

    async fn list_for_entity(&self, key: &EntityKey) -> Result<Vec<PendingChange>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM pending_changes
                     WHERE entity_type = ? AND entity_id = ?
                     ORDER BY seq ASC"
                ),
                [key.entity_type.as_str(), key.entity_id.as_str()],
            )
            .await?;
        self.collect(rows).await
    }

    async fn delete(&self, id: &ChangeId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM pending_changes WHERE id = ?", [id.as_str()])
            .await?;
        Ok(rows > 0)
    }

    async fn delete_for_entity(&self, key: &EntityKey) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM pending_changes WHERE entity_type = ? AND entity_id = ?",
                [key.entity_type.as_str(), key.entity_id.as_str()],
            )
            .await?;
        Ok(rows)
    }

    async fn update_attempt(&self, change: &PendingChange) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE pending_changes
                 SET retry_count = ?, last_error = ?, status = ?, next_attempt_at = ?
                 WHERE id = ?",
                vec![
                    libsql::Value::Integer(i64::from(change.retry_count)),
                    text_or_null(change.last_error.clone()),
                    libsql::Value::Text(change.status.as_str().to_string()),
                    integer_or_null(change.next_attempt_at),
                    libsql::Value::Text(change.id.as_str()),
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(change.id.to_string()));
        }
        Ok(())
    }

    async fn set_status(&self, id: &ChangeId, status: ChangeStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE pending_changes SET status = ? WHERE id = ?",
                [status.as_str().to_string(), id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn rebase_entity(
        &self,
        key: &EntityKey,
        version: Option<i64>,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<u64> {
        let snapshot = snapshot.map(serde_json::to_string).transpose()?;
        let rows = self
            .conn
            .execute(
                "UPDATE pending_changes SET base_version = ?, base_snapshot = ?
                 WHERE entity_type = ? AND entity_id = ?",
                vec![
                    integer_or_null(version),
                    text_or_null(snapshot),
                    libsql::Value::Text(key.entity_type.clone()),
                    libsql::Value::Text(key.entity_id.clone()),
                ],
            )
            .await?;
        Ok(rows)
    }

    async fn replace(&self, old: &ChangeId, change: &PendingChange) -> Result<()> {
        in_transaction(self.conn, self.swap(old, change)).await
    }

    async fn count_by_status(&self) -> Result<BTreeMap<ChangeStatus, usize>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM pending_changes GROUP BY status",
                (),
            )
            .await?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(status.parse()?, usize::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}
