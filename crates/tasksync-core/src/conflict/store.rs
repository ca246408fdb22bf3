//! Persisted conflict records and their resolution workflow.

use serde_json::Value;

use crate::clock::SharedClock;
use crate::db::{in_transaction, ConflictRepository, LibSqlConflictRepository, SharedDatabase};
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    ChangeOperation, ConflictId, ConflictResolution, ConflictStatus, NewChange, PendingChange,
    Resolution, SyncConflict,
};
use crate::queue::{PendingChangeStore, QueueWriter};

use super::detector::detect;

/// Service owning the conflict tables.
#[derive(Clone)]
pub struct ConflictStore {
    db: SharedDatabase,
    queue: PendingChangeStore,
    events: EventBus,
    clock: SharedClock,
    grace_ms: i64,
}

impl ConflictStore {
    pub fn new(
        db: SharedDatabase,
        queue: PendingChangeStore,
        events: EventBus,
        clock: SharedClock,
        grace_ms: u64,
    ) -> Self {
        Self {
            db,
            queue,
            events,
            clock,
            grace_ms: i64::try_from(grace_ms).unwrap_or(i64::MAX),
        }
    }

    /// Turn a version mismatch into a conflict: compare the snapshots, park
    /// the change and publish the record.
    pub async fn raise(
        &self,
        change: &PendingChange,
        server_version: Value,
        server_version_number: Option<i64>,
    ) -> Result<SyncConflict> {
        let conflict_fields = detect(
            &change.payload,
            &server_version,
            change.base_snapshot.as_ref(),
        );

        let conflict = SyncConflict {
            id: ConflictId::new(),
            change_id: change.id,
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            entity_label: change.display_label(),
            local_version: change.payload.clone(),
            server_version,
            server_version_number,
            conflict_fields,
            detected_at: self.clock.now_ms(),
            status: ConflictStatus::Pending,
            resolved_at: None,
        };

        self.queue.mark_conflicted(&change.id).await?;
        self.add(conflict).await
    }

    /// Store a conflict record and announce it.
    pub async fn add(&self, conflict: SyncConflict) -> Result<SyncConflict> {
        {
            let db = self.db.lock().await;
            LibSqlConflictRepository::new(db.connection())
                .insert(&conflict)
                .await
                .map_err(|e| Error::Persistence(format!("failed to store conflict: {e}")))?;
        }

        tracing::warn!(
            conflict_id = %conflict.id,
            entity = %conflict.entity_key(),
            fields = ?conflict.conflict_fields,
            "Sync conflict detected"
        );
        self.events
            .publish(SyncEvent::ConflictDetected(Box::new(conflict.clone())));
        Ok(conflict)
    }

    pub async fn get(&self, id: &ConflictId) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection()).get(id).await
    }

    async fn require(&self, id: &ConflictId) -> Result<SyncConflict> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }

    /// Open conflicts plus those resolved within the grace window, oldest first.
    pub async fn list_active(&self) -> Result<Vec<SyncConflict>> {
        let resolved_since = self.clock.now_ms().saturating_sub(self.grace_ms);
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_active(resolved_since)
            .await
    }

    /// Full conflict history, newest first.
    pub async fn list_all(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_all(limit)
            .await
    }

    pub async fn resolutions(&self, limit: usize) -> Result<Vec<ConflictResolution>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_resolutions(limit)
            .await
    }

    /// Apply a human decision to a conflict and record it.
    ///
    /// The status check, the queue rewrite, the version tracking and the
    /// resolution record share one lock acquisition and one transaction, so
    /// a failure leaves the conflict pending with its change still parked.
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged_data: Option<Value>,
        resolved_by: &str,
    ) -> Result<ConflictResolution> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let repo = LibSqlConflictRepository::new(conn);

        let conflict = repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(Error::validation(format!("conflict {id} is already resolved")));
        }

        let merged_data = match (resolution, merged_data) {
            (Resolution::Merged, Some(data)) if data.is_object() => Some(data),
            (Resolution::Merged, Some(_)) => {
                return Err(Error::validation("merged data must be a JSON object"));
            }
            (Resolution::Merged, None) => {
                return Err(Error::validation("merged resolution requires merged data"));
            }
            (_, _) => None,
        };

        let record = ConflictResolution {
            conflict_id: conflict.id,
            resolution,
            merged_data,
            resolved_at: self.clock.now_ms(),
            resolved_by: resolved_by.to_string(),
        };
        let writer = self.queue.writer(conn);

        in_transaction(conn, async {
            match resolution {
                Resolution::KeepLocal => {
                    requeue(&writer, &conflict, conflict.local_version.clone()).await?;
                }
                Resolution::Merged => {
                    let payload = record.merged_data.clone().unwrap_or(Value::Null);
                    requeue(&writer, &conflict, payload).await?;
                }
                Resolution::KeepServer => accept_server(&writer, &conflict).await?,
            }
            repo.update_status(&conflict.id, ConflictStatus::Resolved, Some(record.resolved_at))
                .await?;
            repo.insert_resolution(&record).await
        })
        .await?;
        drop(db);

        if resolution == Resolution::KeepServer {
            self.events.publish(SyncEvent::ServerVersionAccepted {
                entity_type: conflict.entity_type.clone(),
                entity_id: conflict.entity_id.clone(),
                version: conflict.server_version_number,
                snapshot: conflict.server_version.clone(),
            });
        }

        tracing::info!(
            conflict_id = %conflict.id,
            entity = %conflict.entity_key(),
            resolution = %resolution,
            resolved_by,
            "Conflict resolved"
        );
        Ok(record)
    }

    /// Set a conflict aside without resolving it. The local change stays
    /// parked and the conflict can still be resolved later.
    pub async fn dismiss_conflict(&self, id: &ConflictId) -> Result<SyncConflict> {
        let mut conflict = self.require(id).await?;
        match conflict.status {
            ConflictStatus::Resolved => {
                return Err(Error::validation(format!("conflict {id} is already resolved")));
            }
            ConflictStatus::Dismissed => return Ok(conflict),
            ConflictStatus::Pending => {}
        }

        {
            let db = self.db.lock().await;
            LibSqlConflictRepository::new(db.connection())
                .update_status(id, ConflictStatus::Dismissed, None)
                .await?;
        }
        tracing::info!(conflict_id = %id, "Conflict dismissed");

        conflict.status = ConflictStatus::Dismissed;
        Ok(conflict)
    }
}

/// Put `payload` back in the queue in place of the conflicted change, based
/// on the server version so it does not collide again.
async fn requeue(writer: &QueueWriter<'_>, conflict: &SyncConflict, payload: Value) -> Result<()> {
    let operation = if payload.is_null() {
        ChangeOperation::Delete
    } else {
        ChangeOperation::Update
    };
    let server_snapshot =
        (!conflict.server_version.is_null()).then(|| conflict.server_version.clone());

    let change = NewChange {
        entity_type: conflict.entity_type.clone(),
        entity_id: conflict.entity_id.clone(),
        entity_label: Some(conflict.entity_label.clone()),
        operation,
        payload,
        base_version: conflict.server_version_number,
        base_snapshot: server_snapshot.clone(),
    };
    writer.requeue(&conflict.change_id, change).await?;

    if let (Some(version), Some(snapshot)) = (conflict.server_version_number, server_snapshot) {
        writer
            .track_version(&conflict.entity_key(), version, &snapshot)
            .await?;
    }
    Ok(())
}

/// Drop every local change of the entity and adopt the server snapshot.
async fn accept_server(writer: &QueueWriter<'_>, conflict: &SyncConflict) -> Result<()> {
    let key = conflict.entity_key();
    writer.discard_entity(&key).await?;

    match (conflict.server_version_number, conflict.server_version.is_null()) {
        (Some(version), false) => {
            writer
                .track_version(&key, version, &conflict.server_version)
                .await
        }
        _ => writer.forget_version(&key).await,
    }
}
