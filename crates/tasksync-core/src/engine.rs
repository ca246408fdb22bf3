//! Wiring of the sync core for an application.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::coalescer::ActivityLogger;
use crate::config::SyncSettings;
use crate::conflict::ConflictStore;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};
use crate::db::SharedDatabase;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent, SyncReport};
use crate::models::{
    ActivityEntry, ChangeId, ChangeOperation, ConflictId, ConflictResolution, NetworkStatus,
    NewChange, PendingChange, Resolution, SyncConflict,
};
use crate::queue::{PendingChangeStore, QueueCounts};
use crate::sync::{ProcessorDeps, RemoteStore, SyncProcessor};

/// Entry point used by the surrounding application.
///
/// Owns the services and the background tasks. Producers report mutations and
/// activity here; observers subscribe to [`SyncEvent`]s.
pub struct SyncEngine<P, R> {
    settings: SyncSettings,
    events: EventBus,
    queue: PendingChangeStore,
    conflicts: ConflictStore,
    monitor: ConnectivityMonitor<P>,
    processor: SyncProcessor<R>,
    activity: ActivityLogger,
}

impl<P: ReachabilityProbe, R: RemoteStore> SyncEngine<P, R> {
    pub fn new(db: SharedDatabase, settings: SyncSettings, probe: P, remote: R, clock: SharedClock) -> Self {
        let events = EventBus::new();
        let queue = PendingChangeStore::new(db.clone(), clock.clone());
        let conflicts = ConflictStore::new(
            db.clone(),
            queue.clone(),
            events.clone(),
            clock.clone(),
            settings.conflict_grace_ms,
        );
        let monitor = ConnectivityMonitor::new(
            probe,
            clock.clone(),
            events.clone(),
            settings.poll_interval(),
            settings.offline_after_failures,
        );
        let processor = SyncProcessor::new(ProcessorDeps {
            db: db.clone(),
            queue: queue.clone(),
            conflicts: conflicts.clone(),
            remote,
            events: events.clone(),
            clock: clock.clone(),
            policy: settings.retry_policy(),
            request_timeout: settings.request_timeout(),
        });
        let activity = ActivityLogger::new(db, clock, settings.activity_debounce());

        Self {
            settings,
            events,
            queue,
            conflicts,
            monitor,
            processor,
            activity,
        }
    }

    /// Start monitoring and drain whatever survived the last session once the
    /// server is reachable.
    pub async fn initialize(&self) -> NetworkStatus {
        self.processor.listen(self.monitor.subscribe());
        let status = self.monitor.initialize().await;
        self.processor.observe(&status);
        if status.can_sync() {
            self.processor.trigger();
        }
        status
    }

    /// Producer entry point for local mutations.
    pub async fn record_mutation(&self, change: NewChange) -> Result<ChangeId> {
        let id = self.queue.record(change).await?;
        if self.monitor.status().can_sync() {
            self.processor.trigger();
        }
        Ok(id)
    }

    pub async fn record_update(&self, entity_type: &str, entity_id: &str, payload: Value) -> Result<ChangeId> {
        self.record_mutation(NewChange::new(
            entity_type,
            entity_id,
            ChangeOperation::Update,
            payload,
        ))
        .await
    }

    pub fn record_activity(&self, entry: ActivityEntry) -> Result<()> {
        self.activity.record_entry(entry)
    }

    /// Manual sync: check connectivity first, then drain ignoring backoff.
    /// `None` when the server is unreachable.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        let status = self.monitor.ping().await;
        self.processor.observe(&status);
        if !status.can_sync() {
            tracing::info!(state = %status.state, "Manual sync skipped, server unreachable");
            return Ok(None);
        }
        self.processor.sync_now().await.map(Some)
    }

    pub async fn ping(&self) -> NetworkStatus {
        let status = self.monitor.ping().await;
        self.processor.observe(&status);
        status
    }

    pub fn status(&self) -> NetworkStatus {
        self.monitor.status()
    }

    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        self.queue.list_pending().await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.queue.counts().await
    }

    pub async fn retry_failed(&self, id: &ChangeId) -> Result<PendingChange> {
        let change = self.queue.retry_failed(id).await?;
        if self.monitor.status().can_sync() {
            self.processor.trigger();
        }
        Ok(change)
    }

    pub async fn active_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.conflicts.list_active().await
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged_data: Option<Value>,
        resolved_by: &str,
    ) -> Result<ConflictResolution> {
        let record = self
            .conflicts
            .resolve_conflict(id, resolution, merged_data, resolved_by)
            .await?;
        if resolution != Resolution::KeepServer && self.monitor.status().can_sync() {
            self.processor.trigger();
        }
        Ok(record)
    }

    pub async fn dismiss_conflict(&self, id: &ConflictId) -> Result<SyncConflict> {
        self.conflicts.dismiss_conflict(id).await
    }

    pub async fn last_synced_at(&self) -> Result<Option<i64>> {
        self.processor.last_synced_at().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn queue(&self) -> &PendingChangeStore {
        &self.queue
    }

    pub const fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub const fn activity(&self) -> &ActivityLogger {
        &self.activity
    }

    /// Flush buffered activity, then stop every background task. The flush
    /// error, if any, is returned after shutdown completed.
    pub async fn dispose(&self) -> Result<()> {
        let flushed = self.activity.flush_all().await;
        self.activity.dispose();
        self.processor.dispose();
        self.monitor.cleanup();
        tracing::info!("Sync engine stopped");
        flushed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::db::Database;
    use crate::models::{ChangeStatus, ConnectivityState, EntityKey};
    use crate::testing::{FakeProbe, FakeRemote};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine(probe: &FakeProbe, remote: &FakeRemote) -> SyncEngine<FakeProbe, FakeRemote> {
        let db = Database::open_in_memory().await.unwrap().into_shared();
        SyncEngine::new(
            db,
            SyncSettings::default(),
            probe.clone(),
            remote.clone(),
            ManualClock::new(1_000),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_delete_of_entity_is_rejected() {
        let probe = FakeProbe::new(false, false);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;

        engine
            .record_mutation(NewChange::delete("task", "t1"))
            .await
            .unwrap();
        let error = engine
            .record_mutation(NewChange::delete("task", "t1"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));

        let error = engine
            .record_update("task", "t1", json!({ "title": "revived" }))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        assert_eq!(engine.pending_changes().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_sync_is_skipped_while_offline() {
        let probe = FakeProbe::new(true, false);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;

        engine
            .record_mutation(NewChange::create("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();
        assert!(engine.sync_now().await.unwrap().is_none());
        assert_eq!(remote.total_attempts(), 0);

        let change = &engine.pending_changes().await.unwrap()[0];
        assert_eq!(change.retry_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_edits_sync_after_reconnect() {
        let probe = FakeProbe::new(false, false);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;
        assert_eq!(engine.initialize().await.state, ConnectivityState::Offline);

        engine
            .record_mutation(NewChange::create("task", "T", json!({ "title": "Draft", "priority": 1 })))
            .await
            .unwrap();
        engine
            .record_update("task", "T", json!({ "title": "Report", "priority": 1 }))
            .await
            .unwrap();

        probe.set_interface_up(true);
        probe.set_reachable(true);
        // The reconnect may also start a background drain; either way the
        // manual sync returns once the queue is empty.
        let report = engine.sync_now().await.unwrap().unwrap();

        assert_eq!(report.remaining, 0);
        assert!(engine.pending_changes().await.unwrap().is_empty());
        assert_eq!(
            remote.current(&EntityKey::new("task", "T")),
            Some((2, json!({ "title": "Report", "priority": 1 })))
        );
        assert_eq!(engine.last_synced_at().await.unwrap(), Some(1_000));
        engine.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_round_trip_through_engine() {
        let probe = FakeProbe::new(true, true);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;
        let key = EntityKey::new("task", "t1");
        remote.seed(&key, 3, json!({ "title": "Server" }));

        engine
            .record_mutation(
                NewChange::update("task", "t1", json!({ "title": "Local" }))
                    .with_base(2, Some(json!({ "title": "Base" }))),
            )
            .await
            .unwrap();
        let mut events = engine.subscribe();
        let report = engine.sync_now().await.unwrap().unwrap();
        assert_eq!(report.conflicts, 1);

        let conflict = engine.active_conflicts().await.unwrap().remove(0);
        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConflictDetected(published) = event {
                assert_eq!(published.id, conflict.id);
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);

        engine
            .resolve_conflict(&conflict.id, Resolution::KeepServer, None, "tester")
            .await
            .unwrap();
        assert!(engine.pending_changes().await.unwrap().is_empty());
        assert_eq!(remote.current(&key), Some((3, json!({ "title": "Server" }))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_failed_requeues_permanent_failure() {
        let probe = FakeProbe::new(true, true);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;
        let key = EntityKey::new("task", "t1");

        let id = engine
            .record_mutation(NewChange::create("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();
        remote.fail_next(&key, crate::sync::RemoteError::Rejected("quota (403)".to_string()));
        engine.processor.sync_now().await.unwrap();
        assert_eq!(
            engine.queue.get(&id).await.unwrap().unwrap().status,
            ChangeStatus::Failed
        );

        let change = engine.retry_failed(&id).await.unwrap();
        assert_eq!(change.status, ChangeStatus::Pending);
        engine.sync_now().await.unwrap();
        assert!(engine.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispose_flushes_activity() {
        let probe = FakeProbe::new(false, false);
        let remote = FakeRemote::default();
        let engine = engine(&probe, &remote).await;

        engine
            .record_activity(ActivityEntry::new("t1", "command", "make", 5))
            .unwrap();
        engine.dispose().await.unwrap();
        assert_eq!(engine.activity().pending_len("t1"), 0);
        assert_eq!(engine.activity().list_for_task("t1", 5).await.unwrap().len(), 1);
    }
}
