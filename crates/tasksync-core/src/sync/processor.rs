//! Drains the pending change queue against the remote store.
//!
//! A run walks the queue in enqueue order. Each entity is applied strictly in
//! order: once an entity's head change is not applied (conflict, failure,
//! backoff) the rest of that entity waits for a later run while other
//! entities keep going. Only one run is active at a time; triggers that
//! arrive meanwhile make the active run go around once more.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::RetryPolicy;
use crate::conflict::ConflictStore;
use crate::db::{LibSqlSyncStateRepository, SharedDatabase, SyncStateRepository, SyncStateSnapshot};
use crate::error::Result;
use crate::events::{EventBus, ProgressItem, SyncEvent, SyncReport};
use crate::models::{ChangeStatus, EntityKey, NetworkStatus, PendingChange};
use crate::queue::PendingChangeStore;

use super::remote::{RemoteError, RemoteStore};

/// Outcome of one change within a run
enum Applied {
    Success,
    Conflict,
    /// Retry budget left, rescheduled with backoff
    Retrying,
    Failed,
}

/// Everything the processor needs, injected by the owner.
pub struct ProcessorDeps<R> {
    pub db: SharedDatabase,
    pub queue: PendingChangeStore,
    pub conflicts: ConflictStore,
    pub remote: R,
    pub events: EventBus,
    pub clock: SharedClock,
    pub policy: RetryPolicy,
    pub request_timeout: Duration,
}

struct Inner<R> {
    deps: ProcessorDeps<R>,
    run_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    last_status: Mutex<Option<NetworkStatus>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Sync queue processor
pub struct SyncProcessor<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for SyncProcessor<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore> SyncProcessor<R> {
    pub fn new(deps: ProcessorDeps<R>) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                run_lock: tokio::sync::Mutex::new(()),
                rerun: AtomicBool::new(false),
                last_status: Mutex::new(None),
                retry_timer: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    fn from_weak(inner: &Weak<Inner<R>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// User-initiated sync. Waits for an active run to finish, then drains
    /// ignoring backoff schedules but not the retry ceiling.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let report = {
            let _running = self.inner.run_lock.lock().await;
            self.drain(true).await?
        };

        if self.inner.rerun.swap(false, Ordering::SeqCst) {
            self.trigger();
        }
        self.schedule_retry().await;
        Ok(report)
    }

    /// Start an automatic run in the background.
    pub fn trigger(&self) {
        let processor = self.clone();
        tokio::spawn(async move {
            if let Err(error) = processor.run().await {
                tracing::warn!("Automatic sync run failed: {error}");
            }
        });
    }

    /// Remember the latest connectivity status. Automatic runs are skipped
    /// while the last known status does not allow syncing.
    pub fn observe(&self, status: &NetworkStatus) {
        *lock(&self.inner.last_status) = Some(*status);
    }

    fn known_offline(&self) -> bool {
        lock(&self.inner.last_status)
            .as_ref()
            .is_some_and(|status| !status.can_sync())
    }

    /// Run whenever connectivity comes back.
    pub fn listen(&self, mut statuses: broadcast::Receiver<NetworkStatus>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let status = match statuses.recv().await {
                    Ok(status) => status,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Connectivity listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(processor) = Self::from_weak(&weak) else {
                    break;
                };
                processor.observe(&status);
                if status.can_sync() {
                    tracing::info!("Connectivity restored, draining pending changes");
                    processor.trigger();
                }
            }
        });

        if let Some(previous) = lock(&self.inner.listener).replace(handle) {
            previous.abort();
        }
    }

    /// Stop listening and cancel any scheduled retry. Queued changes stay in
    /// the store.
    pub fn dispose(&self) {
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.retry_timer).take() {
            handle.abort();
        }
    }

    /// Completion time of the last run that left nothing unsynced.
    pub async fn last_synced_at(&self) -> Result<Option<i64>> {
        let db = self.inner.deps.db.lock().await;
        Ok(LibSqlSyncStateRepository::new(db.connection())
            .load()
            .await?
            .last_synced_at)
    }

    /// Automatic run. Skipped while offline; folded into the active run when
    /// one is in progress.
    async fn run(&self) -> Result<Option<SyncReport>> {
        if self.known_offline() {
            tracing::debug!("Skipping automatic sync run while offline");
            return Ok(None);
        }

        let inner = &self.inner;
        let mut last_report = None;
        loop {
            let Ok(guard) = inner.run_lock.try_lock() else {
                inner.rerun.store(true, Ordering::SeqCst);
                tracing::debug!("Sync run already active, coalescing trigger");
                return Ok(last_report);
            };

            inner.rerun.store(false, Ordering::SeqCst);
            let report = self.drain(false).await;
            drop(guard);

            last_report = Some(report?);
            if !inner.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
        }

        self.schedule_retry().await;
        Ok(last_report)
    }

    async fn drain(&self, manual: bool) -> Result<SyncReport> {
        let deps = &self.inner.deps;
        let started_at = deps.clock.now_ms();
        let changes = deps.queue.list_pending().await?;

        let mut report = SyncReport::default();
        let mut blocked: HashSet<EntityKey> = HashSet::new();
        let mut queue_length = changes
            .iter()
            .filter(|change| change.status == ChangeStatus::Pending)
            .count();

        tracing::info!(queue_length, manual, "Sync run started");

        for change in changes {
            let key = change.entity_key();
            if blocked.contains(&key) {
                continue;
            }
            if change.status != ChangeStatus::Pending {
                blocked.insert(key);
                continue;
            }
            if !manual && !change.is_due(started_at) {
                report.deferred += 1;
                blocked.insert(key);
                queue_length = queue_length.saturating_sub(1);
                continue;
            }

            // Earlier changes of this entity may have rebased it during this run.
            let change = match deps.queue.get(&change.id).await {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(change_id = %change.id, "Failed to reload change: {error}");
                    blocked.insert(key);
                    continue;
                }
            };

            deps.events.publish(SyncEvent::SyncProgress {
                queue_length,
                current: Some(ProgressItem::from(&change)),
            });

            match self.apply_one(&change).await {
                Ok(Applied::Success) => report.succeeded += 1,
                Ok(Applied::Conflict) => {
                    report.conflicts += 1;
                    blocked.insert(key);
                }
                Ok(Applied::Retrying | Applied::Failed) => {
                    report.failed += 1;
                    blocked.insert(key);
                }
                Err(error) => {
                    tracing::error!(
                        change_id = %change.id,
                        entity = %key,
                        "Failed to record sync outcome: {error}"
                    );
                    report.failed += 1;
                    blocked.insert(key);
                }
            }
            queue_length = queue_length.saturating_sub(1);
        }

        let counts = deps.queue.counts().await?;
        report.remaining = counts.unsynced();
        report.completed_at = deps.clock.now_ms();

        if report.remaining == 0 {
            let db = deps.db.lock().await;
            LibSqlSyncStateRepository::new(db.connection())
                .save(&SyncStateSnapshot {
                    last_synced_at: Some(report.completed_at),
                })
                .await?;
        }

        deps.events.publish(SyncEvent::SyncProgress {
            queue_length: report.remaining,
            current: None,
        });
        deps.events.publish(SyncEvent::SyncCompleted(report));

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            conflicts = report.conflicts,
            deferred = report.deferred,
            remaining = report.remaining,
            "Sync run finished"
        );
        Ok(report)
    }

    async fn apply_one(&self, change: &PendingChange) -> Result<Applied> {
        let deps = &self.inner.deps;
        tracing::debug!(
            change_id = %change.id,
            entity = %change.entity_key(),
            operation = %change.operation,
            "Applying change"
        );

        let outcome = match tokio::time::timeout(deps.request_timeout, deps.remote.apply(change)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Transient(format!(
                "request timed out after {} ms",
                deps.request_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(snapshot) => {
                deps.queue.dequeue(&change.id).await?;
                let data = (!snapshot.data.is_null()).then_some(&snapshot.data);
                deps.queue
                    .acknowledge(&change.entity_key(), change.operation, snapshot.version, data)
                    .await?;
                Ok(Applied::Success)
            }
            Err(RemoteError::VersionConflict { server }) => {
                deps.conflicts
                    .raise(change, server.data, server.version)
                    .await?;
                Ok(Applied::Conflict)
            }
            Err(RemoteError::Transient(message)) => {
                let updated = deps
                    .queue
                    .mark_failed(&change.id, &message, &deps.policy)
                    .await?;
                if updated.status == ChangeStatus::Failed {
                    self.report_failed(&updated);
                    Ok(Applied::Failed)
                } else {
                    tracing::warn!(
                        change_id = %change.id,
                        retry_count = updated.retry_count,
                        next_attempt_at = ?updated.next_attempt_at,
                        "Transient sync failure: {message}"
                    );
                    Ok(Applied::Retrying)
                }
            }
            Err(RemoteError::Rejected(message)) => {
                let updated = deps.queue.mark_rejected(&change.id, &message).await?;
                self.report_failed(&updated);
                Ok(Applied::Failed)
            }
        }
    }

    fn report_failed(&self, change: &PendingChange) {
        let error = change.last_error.clone().unwrap_or_default();
        tracing::warn!(
            change_id = %change.id,
            entity = %change.entity_key(),
            retry_count = change.retry_count,
            "Change permanently failed: {error}"
        );
        self.inner.deps.events.publish(SyncEvent::ChangeFailed {
            change_id: change.id,
            retry_count: change.retry_count,
            error,
        });
    }

    /// Arm a timer for the earliest backed-off change, replacing any
    /// previously armed one.
    async fn schedule_retry(&self) {
        let deps = &self.inner.deps;
        let next_due = match deps.queue.list_pending().await {
            Ok(changes) => changes
                .iter()
                .filter(|change| change.status == ChangeStatus::Pending)
                .filter_map(|change| change.next_attempt_at)
                .min(),
            Err(error) => {
                tracing::warn!("Could not plan retry: {error}");
                None
            }
        };

        let mut slot = lock(&self.inner.retry_timer);
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let Some(due_at) = next_due else {
            return;
        };

        let wait_ms = u64::try_from(due_at.saturating_sub(deps.clock.now_ms())).unwrap_or(0);
        tracing::debug!(wait_ms, "Scheduled retry run");

        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            if let Some(processor) = Self::from_weak(&weak) {
                lock(&processor.inner.retry_timer).take();
                processor.trigger();
            }
        }));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::models::{ChangeOperation, ConnectivityState, NewChange};
    use crate::testing::FakeRemote;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        processor: SyncProcessor<FakeRemote>,
        queue: PendingChangeStore,
        conflicts: ConflictStore,
        remote: FakeRemote,
        events: EventBus,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        fixture_with_timeout(Duration::from_secs(5)).await
    }

    async fn fixture_with_timeout(request_timeout: Duration) -> Fixture {
        let db = Database::open_in_memory().await.unwrap().into_shared();
        let clock = ManualClock::new(1_000);
        let events = EventBus::new();
        let queue = PendingChangeStore::new(db.clone(), clock.clone());
        let conflicts = ConflictStore::new(
            db.clone(),
            queue.clone(),
            events.clone(),
            clock.clone(),
            1_500,
        );
        let remote = FakeRemote::default();
        let processor = SyncProcessor::new(ProcessorDeps {
            db,
            queue: queue.clone(),
            conflicts: conflicts.clone(),
            remote: remote.clone(),
            events: events.clone(),
            clock: clock.clone(),
            policy: RetryPolicy {
                max_retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
            },
            request_timeout,
        });
        Fixture {
            processor,
            queue,
            conflicts,
            remote,
            events,
            clock,
        }
    }

    fn drain_events(receiver: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_offline_edits_apply_in_order_with_one_sync_stamp() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "T");
        let original = json!({ "title": "Draft", "priority": 1 });
        fx.remote.seed(&key, 1, original.clone());
        fx.queue.track_version(&key, 1, &original).await.unwrap();

        fx.queue
            .enqueue(NewChange::update("task", "T", json!({ "title": "Report", "priority": 1 })))
            .await
            .unwrap();
        fx.queue
            .enqueue(NewChange::update("task", "T", json!({ "title": "Report", "priority": 3 })))
            .await
            .unwrap();

        let mut events = fx.events.subscribe();
        fx.clock.set(5_000);
        let report = fx.processor.sync_now().await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.conflicts, 0);
        assert!(report.is_clean());
        assert_eq!(
            fx.remote.applied_payloads(&key),
            vec![
                json!({ "title": "Report", "priority": 1 }),
                json!({ "title": "Report", "priority": 3 }),
            ]
        );
        assert_eq!(
            fx.remote.current(&key),
            Some((3, json!({ "title": "Report", "priority": 3 })))
        );
        assert_eq!(fx.processor.last_synced_at().await.unwrap(), Some(5_000));

        let completed = drain_events(&mut events)
            .into_iter()
            .filter(|event| matches!(event, SyncEvent::SyncCompleted(_)))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_is_never_overtaken_by_its_update() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "n1");
        fx.queue
            .enqueue(NewChange::create("task", "n1", json!({ "title": "New" })))
            .await
            .unwrap();
        fx.queue
            .enqueue(NewChange::create("task", "other", json!({ "title": "Other" })))
            .await
            .unwrap();
        fx.queue
            .enqueue(NewChange::update("task", "n1", json!({ "title": "Renamed" })))
            .await
            .unwrap();

        // First attempt of the create fails; its update must wait.
        fx.remote.fail_next(&key, RemoteError::Transient("503".to_string()));
        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(fx.remote.applied_payloads(&key).is_empty());

        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(
            fx.remote.applied_operations(&key),
            vec![ChangeOperation::Create, ChangeOperation::Update]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flapping_connectivity_keeps_entity_order() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "T");
        let payloads: Vec<_> = (1..=4).map(|n| json!({ "title": format!("v{n}") })).collect();
        fx.queue
            .enqueue(NewChange::create("task", "T", payloads[0].clone()))
            .await
            .unwrap();
        for payload in &payloads[1..] {
            fx.queue
                .enqueue(NewChange::update("task", "T", payload.clone()))
                .await
                .unwrap();
        }

        // Connectivity drops before every second request.
        for _ in 0..8 {
            fx.remote
                .fail_next(&key, RemoteError::Transient("connection reset".to_string()));
            fx.processor.sync_now().await.unwrap();
            fx.processor.sync_now().await.unwrap();
            if fx.queue.list_pending().await.unwrap().is_empty() {
                break;
            }
        }

        assert!(fx.queue.list_pending().await.unwrap().is_empty());
        assert_eq!(fx.remote.applied_payloads(&key), payloads);
        assert_eq!(fx.remote.current(&key).map(|(_, data)| data), payloads.last().cloned());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_counts_once_and_backs_off() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "t1");
        let id = fx
            .queue
            .enqueue(NewChange::create("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();

        fx.remote.fail_next(&key, RemoteError::Transient("timeout".to_string()));
        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let change = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(change.retry_count, 1);
        assert_eq!(change.status, ChangeStatus::Pending);
        assert_eq!(change.next_attempt_at, Some(2_000));
        assert_eq!(fx.processor.last_synced_at().await.unwrap(), None);

        // An automatic run before the backoff elapses leaves the change alone.
        fx.processor.run().await.unwrap();
        assert_eq!(fx.remote.attempts(&key), 1);

        fx.clock.advance(1_000);
        let report = fx.processor.run().await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_remote_times_out_as_transient() {
        let fx = fixture_with_timeout(Duration::from_millis(50)).await;
        let id = fx
            .queue
            .enqueue(NewChange::update("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();

        fx.remote.set_delay(Duration::from_secs(2));
        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let change = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(change.retry_count, 1);
        assert_eq!(change.status, ChangeStatus::Pending);
        assert!(change
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("timed out")));
        assert_eq!(change.next_attempt_at, Some(2_000));
        assert!(fx
            .remote
            .applied_payloads(&EntityKey::new("task", "t1"))
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exceeding_ceiling_fails_permanently_but_stays_listed() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "t1");
        let id = fx
            .queue
            .enqueue(NewChange::create("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();
        let mut events = fx.events.subscribe();

        for _ in 0..3 {
            fx.remote.fail_next(&key, RemoteError::Transient("503".to_string()));
            fx.processor.sync_now().await.unwrap();
        }

        let change = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
        assert_eq!(change.retry_count, 3);
        assert!(drain_events(&mut events)
            .iter()
            .any(|event| matches!(event, SyncEvent::ChangeFailed { retry_count: 3, .. })));

        // Permanently failed changes are not retried automatically or manually.
        fx.processor.sync_now().await.unwrap();
        assert_eq!(fx.remote.attempts(&key), 3);
        assert_eq!(fx.queue.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_change_fails_immediately_and_others_continue() {
        let fx = fixture().await;
        let bad = EntityKey::new("task", "bad");
        let bad_id = fx
            .queue
            .enqueue(NewChange::create("task", "bad", json!({ "title": "" })))
            .await
            .unwrap();
        fx.queue
            .enqueue(NewChange::create("task", "good", json!({ "title": "ok" })))
            .await
            .unwrap();

        fx.remote
            .fail_next(&bad, RemoteError::Rejected("title required (422)".to_string()));
        let report = fx.processor.sync_now().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let change = fx.queue.get(&bad_id).await.unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
        assert_eq!(change.last_error.as_deref(), Some("title required (422)"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn version_mismatch_raises_exactly_one_conflict() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "t1");
        let base = json!({ "title": "Draft", "priority": 1 });
        fx.queue.track_version(&key, 1, &base).await.unwrap();
        fx.remote
            .seed(&key, 2, json!({ "title": "Server title", "priority": 1 }));

        let id = fx
            .queue
            .enqueue(NewChange::update("task", "t1", json!({ "title": "Local title", "priority": 2 })))
            .await
            .unwrap();
        fx.queue
            .enqueue(NewChange::update("task", "t1", json!({ "title": "Local title", "priority": 3 })))
            .await
            .unwrap();

        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.remaining, 1);

        let change = fx.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Conflicted);
        assert_eq!(change.retry_count, 0);

        let conflicts = fx.conflicts.list_active().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_fields, vec!["title"]);
        assert_eq!(conflicts[0].server_version_number, Some(2));

        // Further runs leave the parked entity alone.
        fx.processor.sync_now().await.unwrap();
        assert_eq!(fx.conflicts.list_active().await.unwrap().len(), 1);
        assert_eq!(fx.remote.attempts(&key), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_resolution_syncs_on_next_run() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "t1");
        fx.remote.seed(&key, 2, json!({ "title": "Server" }));
        fx.queue
            .enqueue(
                NewChange::update("task", "t1", json!({ "title": "Local" }))
                    .with_base(1, Some(json!({ "title": "Draft" }))),
            )
            .await
            .unwrap();

        fx.processor.sync_now().await.unwrap();
        let conflict = fx.conflicts.list_active().await.unwrap().remove(0);
        fx.conflicts
            .resolve_conflict(&conflict.id, crate::models::Resolution::KeepLocal, None, "me")
            .await
            .unwrap();

        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(fx.remote.current(&key), Some((3, json!({ "title": "Local" }))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicted_changes_do_not_block_sync_stamp() {
        let fx = fixture().await;
        let key = EntityKey::new("task", "t1");
        fx.remote.seed(&key, 5, json!({ "title": "Server" }));
        fx.queue
            .enqueue(NewChange::update("task", "t1", json!({ "title": "Local" })).with_base(4, None))
            .await
            .unwrap();

        fx.clock.set(9_000);
        let report = fx.processor.sync_now().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(fx.processor.last_synced_at().await.unwrap(), Some(9_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn automatic_runs_wait_for_connectivity() {
        let fx = fixture().await;
        fx.queue
            .enqueue(NewChange::create("task", "t1", json!({ "title": "a" })))
            .await
            .unwrap();

        fx.processor.observe(&NetworkStatus::default());
        assert!(fx.processor.run().await.unwrap().is_none());
        assert_eq!(fx.queue.list_pending().await.unwrap().len(), 1);

        fx.processor.observe(&NetworkStatus {
            state: ConnectivityState::Online,
            server_reachable: true,
            last_checked_at: 1_000,
        });
        let report = fx.processor.run().await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_triggers_never_drain_twice() {
        let fx = fixture().await;
        for n in 0..5 {
            fx.queue
                .enqueue(NewChange::create("task", format!("t{n}"), json!({ "n": n })))
                .await
                .unwrap();
        }
        fx.remote.set_delay(Duration::from_millis(20));

        let (first, second) = tokio::join!(fx.processor.run(), fx.processor.run());
        let reports: Vec<_> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .collect();

        assert_eq!(reports.len(), 1);
        assert_eq!(fx.remote.max_concurrency(), 1);
        assert_eq!(fx.remote.total_attempts(), 5);
        assert!(fx.queue.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_syncs_wait_for_each_other() {
        let fx = fixture().await;
        for n in 0..3 {
            fx.queue
                .enqueue(NewChange::create("task", format!("t{n}"), json!({ "n": n })))
                .await
                .unwrap();
        }
        fx.remote.set_delay(Duration::from_millis(20));

        let (first, second) = tokio::join!(fx.processor.sync_now(), fx.processor.sync_now());
        let total: usize = [first.unwrap(), second.unwrap()]
            .iter()
            .map(|report| report.succeeded)
            .sum();

        assert_eq!(total, 3);
        assert_eq!(fx.remote.max_concurrency(), 1);
        assert_eq!(fx.remote.total_attempts(), 3);
    }
}
