//! Durable, ordered store of local mutations awaiting remote application.
//!
//! `PendingChangeStore` is the only writer of the `pending_changes` and
//! `entity_versions` tables. Callers go through its narrow contract
//! (enqueue, dequeue, mark_failed, ...) and never touch rows directly.

use std::collections::BTreeMap;

use libsql::Connection;
use serde_json::Value;

use crate::clock::SharedClock;
use crate::config::RetryPolicy;
use crate::db::{
    in_transaction, EntityVersion, EntityVersionRepository, LibSqlEntityVersionRepository,
    LibSqlPendingChangeRepository, PendingChangeRepository, SharedDatabase,
};
use crate::error::{Error, Result};
use crate::models::{ChangeId, ChangeOperation, ChangeStatus, EntityKey, NewChange, PendingChange};

/// Number of stored changes per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub failed: usize,
    pub conflicted: usize,
}

impl QueueCounts {
    fn from_map(map: &BTreeMap<ChangeStatus, usize>) -> Self {
        let get = |status| map.get(&status).copied().unwrap_or(0);
        Self {
            pending: get(ChangeStatus::Pending),
            failed: get(ChangeStatus::Failed),
            conflicted: get(ChangeStatus::Conflicted),
        }
    }

    /// Changes that still have to reach the server without human input
    /// (conflicted ones excluded).
    pub const fn unsynced(&self) -> usize {
        self.pending + self.failed
    }

    pub const fn total(&self) -> usize {
        self.pending + self.failed + self.conflicted
    }
}

/// Service owning the pending change queue.
#[derive(Clone)]
pub struct PendingChangeStore {
    db: SharedDatabase,
    clock: SharedClock,
}

impl PendingChangeStore {
    pub fn new(db: SharedDatabase, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Queue writes on a connection the caller already holds.
    pub(crate) fn writer<'a>(&self, conn: &'a Connection) -> QueueWriter<'a> {
        QueueWriter {
            conn,
            now_ms: self.clock.now_ms(),
        }
    }

    /// Validate and append a change; returns its generated id.
    ///
    /// Changes without an explicit base inherit the tracked server version of
    /// the entity, if any.
    pub async fn enqueue(&self, change: NewChange) -> Result<ChangeId> {
        change.validate()?;

        let db = self.db.lock().await;
        let pending = self.writer(db.connection()).insert(change).await?;
        Ok(pending.id)
    }

    /// Enqueue a producer mutation. Nothing may follow a queued delete of the
    /// same entity; the check and the insert share one lock acquisition.
    pub async fn record(&self, change: NewChange) -> Result<ChangeId> {
        change.validate()?;
        let key = change.entity_key();

        let db = self.db.lock().await;
        let writer = self.writer(db.connection());
        if writer.has_pending_delete(&key).await? {
            return Err(Error::validation(format!(
                "{key} already has a pending delete; {} rejected",
                change.operation
            )));
        }
        let pending = writer.insert(change).await?;
        Ok(pending.id)
    }

    /// Remove a change after it was applied remotely.
    pub async fn dequeue(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        let removed = LibSqlPendingChangeRepository::new(db.connection())
            .delete(id)
            .await?;
        if !removed {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Every stored change in enqueue order, including failed and conflicted ones.
    pub async fn list_pending(&self) -> Result<Vec<PendingChange>> {
        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .list()
            .await
    }

    pub async fn list_for_entity(&self, key: &EntityKey) -> Result<Vec<PendingChange>> {
        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .list_for_entity(key)
            .await
    }

    pub async fn get(&self, id: &ChangeId) -> Result<Option<PendingChange>> {
        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .get(id)
            .await
    }

    async fn require(&self, id: &ChangeId) -> Result<PendingChange> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Record a transient failure: bump the retry count, remember the error and
    /// schedule the next attempt. Once the retry budget is spent the change
    /// becomes permanently failed and leaves automatic processing.
    pub async fn mark_failed(
        &self,
        id: &ChangeId,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<PendingChange> {
        let mut change = self.require(id).await?;
        change.retry_count = change.retry_count.saturating_add(1);
        change.last_error = Some(error.to_string());

        if policy.is_exhausted(change.retry_count) {
            change.status = ChangeStatus::Failed;
            change.next_attempt_at = None;
        } else {
            let delay = i64::try_from(policy.delay_after(change.retry_count)).unwrap_or(i64::MAX);
            change.next_attempt_at = Some(self.clock.now_ms().saturating_add(delay));
        }

        self.persist_attempt(&change).await?;
        Ok(change)
    }

    /// Record a non-retryable rejection; the change is failed immediately.
    pub async fn mark_rejected(&self, id: &ChangeId, error: &str) -> Result<PendingChange> {
        let mut change = self.require(id).await?;
        change.retry_count = change.retry_count.saturating_add(1);
        change.last_error = Some(error.to_string());
        change.status = ChangeStatus::Failed;
        change.next_attempt_at = None;

        self.persist_attempt(&change).await?;
        Ok(change)
    }

    /// Park a change behind an unresolved conflict. The retry count is untouched.
    pub async fn mark_conflicted(&self, id: &ChangeId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .set_status(id, ChangeStatus::Conflicted)
            .await
            .map_err(persistence_error)
    }

    /// Human-initiated retry of a permanently failed change.
    pub async fn retry_failed(&self, id: &ChangeId) -> Result<PendingChange> {
        let mut change = self.require(id).await?;
        if change.status != ChangeStatus::Failed {
            return Err(Error::validation(format!(
                "change {id} is {}, only failed changes can be retried",
                change.status
            )));
        }

        change.status = ChangeStatus::Pending;
        change.retry_count = 0;
        change.next_attempt_at = None;
        self.persist_attempt(&change).await?;
        tracing::info!(change_id = %id, "Failed change re-queued for retry");
        Ok(change)
    }

    async fn persist_attempt(&self, change: &PendingChange) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .update_attempt(change)
            .await
            .map_err(persistence_error)
    }

    /// After a successful apply, base the entity's remaining changes on the
    /// version the server just acknowledged and track it as the new ancestor.
    ///
    /// A delete, or an acknowledgement without both a version and a snapshot,
    /// leaves no usable ancestor: the tracked version is forgotten and the
    /// remaining changes lose their base, so queued and later changes agree.
    pub async fn acknowledge(
        &self,
        key: &EntityKey,
        operation: ChangeOperation,
        version: Option<i64>,
        snapshot: Option<&Value>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let writer = self.writer(db.connection());

        let ancestor = match (version, snapshot) {
            (Some(version), Some(snapshot)) if operation != ChangeOperation::Delete => {
                Some((version, snapshot))
            }
            _ => None,
        };

        in_transaction(db.connection(), async {
            match ancestor {
                Some((version, snapshot)) => writer.track_version(key, version, snapshot).await?,
                None => writer.forget_version(key).await?,
            }
            LibSqlPendingChangeRepository::new(db.connection())
                .rebase_entity(
                    key,
                    ancestor.map(|(version, _)| version),
                    ancestor.map(|(_, snapshot)| snapshot),
                )
                .await?;
            Ok::<(), Error>(())
        })
        .await
    }

    /// Track a server snapshot as the entity's ancestor without touching the queue.
    pub async fn track_version(&self, key: &EntityKey, version: i64, snapshot: &Value) -> Result<()> {
        let db = self.db.lock().await;
        self.writer(db.connection())
            .track_version(key, version, snapshot)
            .await
    }

    pub async fn forget_version(&self, key: &EntityKey) -> Result<()> {
        let db = self.db.lock().await;
        self.writer(db.connection()).forget_version(key).await
    }

    pub async fn tracked_version(&self, key: &EntityKey) -> Result<Option<EntityVersion>> {
        let db = self.db.lock().await;
        LibSqlEntityVersionRepository::new(db.connection())
            .get(key)
            .await
    }

    /// Drop every change of an entity; returns how many were removed.
    pub async fn discard_entity(&self, key: &EntityKey) -> Result<u64> {
        let db = self.db.lock().await;
        self.writer(db.connection()).discard_entity(key).await
    }

    /// Replace a change with a fresh one at the same queue position.
    pub async fn replace(&self, old: &ChangeId, change: NewChange) -> Result<ChangeId> {
        change.validate()?;
        let pending = PendingChange::from_new(change, self.clock.now_ms());

        let db = self.db.lock().await;
        LibSqlPendingChangeRepository::new(db.connection())
            .replace(old, &pending)
            .await?;
        Ok(pending.id)
    }

    /// Whether a delete of the entity is already queued.
    pub async fn has_pending_delete(&self, key: &EntityKey) -> Result<bool> {
        let db = self.db.lock().await;
        self.writer(db.connection()).has_pending_delete(key).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        let map = LibSqlPendingChangeRepository::new(db.connection())
            .count_by_status()
            .await?;
        Ok(QueueCounts::from_map(&map))
    }
}

/// Queue writes bound to a held connection, so callers can combine them with
/// other statements under one lock acquisition or transaction. Nothing here
/// opens a transaction.
pub(crate) struct QueueWriter<'a> {
    conn: &'a Connection,
    now_ms: i64,
}

impl QueueWriter<'_> {
    /// Append a validated change at the tail of the queue.
    pub(crate) async fn insert(&self, change: NewChange) -> Result<PendingChange> {
        let inherited = match change.base_version {
            Some(_) => None,
            None => {
                LibSqlEntityVersionRepository::new(self.conn)
                    .get(&change.entity_key())
                    .await?
            }
        };

        let mut pending = PendingChange::from_new(change, self.now_ms);
        if let Some(tracked) = inherited {
            pending.base_version = Some(tracked.version);
            pending.base_snapshot = Some(tracked.snapshot);
        }

        LibSqlPendingChangeRepository::new(self.conn)
            .insert(&pending)
            .await
            .map_err(persistence_error)?;

        tracing::debug!(
            change_id = %pending.id,
            entity = %pending.entity_key(),
            operation = %pending.operation,
            "Enqueued pending change"
        );
        Ok(pending)
    }

    /// Put `change` in place of `old`, or at the tail when `old` is gone.
    pub(crate) async fn requeue(&self, old: &ChangeId, change: NewChange) -> Result<ChangeId> {
        change.validate()?;
        let repo = LibSqlPendingChangeRepository::new(self.conn);
        if repo.get(old).await?.is_none() {
            return Ok(self.insert(change).await?.id);
        }

        let pending = PendingChange::from_new(change, self.now_ms);
        repo.swap(old, &pending).await.map_err(persistence_error)?;
        Ok(pending.id)
    }

    pub(crate) async fn has_pending_delete(&self, key: &EntityKey) -> Result<bool> {
        Ok(LibSqlPendingChangeRepository::new(self.conn)
            .list_for_entity(key)
            .await?
            .iter()
            .any(|change| change.operation == ChangeOperation::Delete))
    }

    pub(crate) async fn discard_entity(&self, key: &EntityKey) -> Result<u64> {
        let removed = LibSqlPendingChangeRepository::new(self.conn)
            .delete_for_entity(key)
            .await?;
        tracing::info!(entity = %key, removed, "Discarded local changes");
        Ok(removed)
    }

    pub(crate) async fn track_version(
        &self,
        key: &EntityKey,
        version: i64,
        snapshot: &Value,
    ) -> Result<()> {
        LibSqlEntityVersionRepository::new(self.conn)
            .upsert(&EntityVersion {
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                version,
                snapshot: snapshot.clone(),
                updated_at: self.now_ms,
            })
            .await
    }

    pub(crate) async fn forget_version(&self, key: &EntityKey) -> Result<()> {
        LibSqlEntityVersionRepository::new(self.conn)
            .delete(key)
            .await
    }
}

fn persistence_error(error: Error) -> Error {
    match error {
        Error::NotFound(_) | Error::Validation(_) => error,
        other => {
            tracing::error!("Pending change store write failed: {other}");
            Error::Persistence(other.to_string())
        }
    }
}
