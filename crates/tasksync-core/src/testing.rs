//! In-memory doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::connectivity::ReachabilityProbe;
use crate::models::{ChangeOperation, EntityKey, PendingChange};
use crate::sync::{RemoteError, RemoteResult, RemoteSnapshot, RemoteStore};

#[derive(Default)]
struct RemoteState {
    entities: HashMap<EntityKey, (i64, Value)>,
    failures: HashMap<EntityKey, VecDeque<RemoteError>>,
    applied: Vec<(EntityKey, ChangeOperation, Value)>,
    attempts: HashMap<EntityKey, usize>,
    delay: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Versioned server that rejects writes based on a stale version.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn seed(&self, key: &EntityKey, version: i64, data: Value) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert(key.clone(), (version, data));
    }

    /// Fail the next attempt for `key` with `error`.
    pub fn fail_next(&self, key: &EntityKey, error: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(key.clone())
            .or_default()
            .push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn current(&self, key: &EntityKey) -> Option<(i64, Value)> {
        self.state.lock().unwrap().entities.get(key).cloned()
    }

    pub fn applied_payloads(&self, key: &EntityKey) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .filter(|(applied, _, _)| applied == key)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    pub fn applied_operations(&self, key: &EntityKey) -> Vec<ChangeOperation> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .filter(|(applied, _, _)| applied == key)
            .map(|(_, operation, _)| *operation)
            .collect()
    }

    pub fn attempts(&self, key: &EntityKey) -> usize {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.values().sum()
    }

    pub fn max_concurrency(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn settle(&self, change: &PendingChange) -> RemoteResult<RemoteSnapshot> {
        let key = change.entity_key();
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;

        if let Some(error) = state.failures.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let current = state.entities.get(&key).cloned();
        let stale = match (&current, change.operation) {
            (Some(_), ChangeOperation::Create) => true,
            (Some((version, _)), _) => change.base_version.is_some_and(|base| base != *version),
            (None, _) => false,
        };
        if stale {
            let (version, data) = current.unwrap_or((0, Value::Null));
            return Err(RemoteError::VersionConflict {
                server: RemoteSnapshot {
                    version: Some(version),
                    data,
                },
            });
        }

        state
            .applied
            .push((key.clone(), change.operation, change.payload.clone()));

        match change.operation {
            ChangeOperation::Delete => {
                state.entities.remove(&key);
                Ok(RemoteSnapshot::default())
            }
            ChangeOperation::Update if current.is_none() => {
                Err(RemoteError::Rejected("not found (404)".to_string()))
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                let version = current.map_or(1, |(version, _)| version + 1);
                state
                    .entities
                    .insert(key, (version, change.payload.clone()));
                Ok(RemoteSnapshot {
                    version: Some(version),
                    data: change.payload.clone(),
                })
            }
        }
    }
}

impl RemoteStore for FakeRemote {
    async fn apply(&self, change: &PendingChange) -> RemoteResult<RemoteSnapshot> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            *state.attempts.entry(change.entity_key()).or_default() += 1;
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.settle(change)
    }
}

/// Probe whose answers are flipped by the test.
#[derive(Clone)]
pub struct FakeProbe {
    interface_up: Arc<AtomicBool>,
    reachable: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
}

impl FakeProbe {
    pub fn new(interface_up: bool, reachable: bool) -> Self {
        Self {
            interface_up: Arc::new(AtomicBool::new(interface_up)),
            reachable: Arc::new(AtomicBool::new(reachable)),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_interface_up(&self, up: bool) {
        self.interface_up.store(up, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl ReachabilityProbe for FakeProbe {
    fn interface_up(&self) -> bool {
        self.interface_up.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}
