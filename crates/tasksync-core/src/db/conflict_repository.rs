//! Sync conflict and resolution history repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use libsql::{Connection, Row};

use crate::error::{Error, Result};
use crate::models::{ConflictId, ConflictResolution, ConflictStatus, SyncConflict};
use crate::util::{column_integer, column_text, integer_or_null, text_or_null};

const SELECT_COLUMNS: &str = "id, change_id, entity_type, entity_id, entity_label,
    local_version, server_version, server_version_number, conflict_fields, detected_at,
    status, resolved_at";

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    async fn insert(&self, conflict: &SyncConflict) -> Result<()>;

    async fn get(&self, id: &ConflictId) -> Result<Option<SyncConflict>>;

    /// Set status and resolution time of a conflict
    async fn update_status(
        &self,
        id: &ConflictId,
        status: ConflictStatus,
        resolved_at: Option<i64>,
    ) -> Result<()>;

    /// Open conflicts plus conflicts resolved at or after `resolved_since`, oldest first
    async fn list_active(&self, resolved_since: i64) -> Result<Vec<SyncConflict>>;

    /// Every conflict, newest first
    async fn list_all(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Append a resolution; fails if the conflict already has one
    async fn insert_resolution(&self, resolution: &ConflictResolution) -> Result<()>;

    /// Resolution history, newest first
    async fn list_resolutions(&self, limit: usize) -> Result<Vec<ConflictResolution>>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<SyncConflict> {
        let id: String = row.get(0)?;
        let change_id: String = row.get(1)?;
        let local_version: String = row.get(5)?;
        let server_version: String = row.get(6)?;
        let conflict_fields: String = row.get(8)?;
        let status: String = row.get(10)?;

        Ok(SyncConflict {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid conflict id '{id}'")))?,
            change_id: change_id
                .parse()
                .map_err(|_| Error::Database(format!("invalid change id '{change_id}'")))?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            entity_label: row.get(4)?,
            local_version: serde_json::from_str(&local_version)?,
            server_version: serde_json::from_str(&server_version)?,
            server_version_number: column_integer(row, 7)?,
            conflict_fields: serde_json::from_str(&conflict_fields)?,
            detected_at: row.get(9)?,
            status: status.parse()?,
            resolved_at: column_integer(row, 11)?,
        })
    }

    fn parse_resolution(row: &Row) -> Result<ConflictResolution> {
        let conflict_id: String = row.get(0)?;
        let resolution: String = row.get(1)?;

        Ok(ConflictResolution {
            conflict_id: conflict_id
                .parse()
                .map_err(|_| Error::Database(format!("invalid conflict id '{conflict_id}'")))?,
            resolution: resolution.parse()?,
            merged_data: column_text(row, 2)?
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            resolved_at: row.get(3)?,
            resolved_by: row.get(4)?,
        })
    }

    async fn collect(mut rows: libsql::Rows) -> Result<Vec<SyncConflict>> {
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    id, change_id, entity_type, entity_id, entity_label, local_version,
                    server_version, server_version_number, conflict_fields, detected_at,
                    status, resolved_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    libsql::Value::Text(conflict.id.as_str()),
                    libsql::Value::Text(conflict.change_id.as_str()),
                    libsql::Value::Text(conflict.entity_type.clone()),
                    libsql::Value::Text(conflict.entity_id.clone()),
                    libsql::Value::Text(conflict.entity_label.clone()),
                    libsql::Value::Text(serde_json::to_string(&conflict.local_version)?),
                    libsql::Value::Text(serde_json::to_string(&conflict.server_version)?),
                    integer_or_null(conflict.server_version_number),
                    libsql::Value::Text(serde_json::to_string(&conflict.conflict_fields)?),
                    libsql::Value::Integer(conflict.detected_at),
                    libsql::Value::Text(conflict.status.as_str().to_string()),
                    integer_or_null(conflict.resolved_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: &ConflictId,
        status: ConflictStatus,
        resolved_at: Option<i64>,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET status = ?, resolved_at = ? WHERE id = ?",
                vec![
                    libsql::Value::Text(status.as_str().to_string()),
                    integer_or_null(resolved_at),
                    libsql::Value::Text(id.as_str()),
                ],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_active(&self, resolved_since: i64) -> Result<Vec<SyncConflict>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_conflicts
                     WHERE status IN ('pending', 'dismissed')
                        OR (status = 'resolved' AND resolved_at >= ?)
                     ORDER BY detected_at ASC, id ASC"
                ),
                [resolved_since],
            )
            .await?;
        Self::collect(rows).await
    }

    async fn list_all(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_conflicts
                     ORDER BY detected_at DESC, id DESC
                     LIMIT ?"
                ),
                [limit as i64],
            )
            .await?;
        Self::collect(rows).await
    }

    async fn insert_resolution(&self, resolution: &ConflictResolution) -> Result<()> {
        let merged_data = resolution
            .merged_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                "INSERT INTO conflict_resolutions
                    (conflict_id, resolution, merged_data, resolved_at, resolved_by)
                 VALUES (?, ?, ?, ?, ?)",
                vec![
                    libsql::Value::Text(resolution.conflict_id.as_str()),
                    libsql::Value::Text(resolution.resolution.as_str().to_string()),
                    text_or_null(merged_data),
                    libsql::Value::Integer(resolution.resolved_at),
                    libsql::Value::Text(resolution.resolved_by.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_resolutions(&self, limit: usize) -> Result<Vec<ConflictResolution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT conflict_id, resolution, merged_data, resolved_at, resolved_by
                 FROM conflict_resolutions
                 ORDER BY resolved_at DESC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut resolutions = Vec::new();
        while let Some(row) = rows.next().await? {
            resolutions.push(Self::parse_resolution(&row)?);
        }
        Ok(resolutions)
    }
}
