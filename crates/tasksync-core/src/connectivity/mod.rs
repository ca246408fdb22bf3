//! Network reachability monitoring.
//!
//! The monitor combines a cheap local check (is any route up?) with a real
//! request to the server. `online` is only entered after the server answered;
//! a lost server first shows as `reconnecting` and degrades to `offline` after
//! repeated failures. Subscribers see each transition exactly once.

mod probe;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::events::{EventBus, SyncEvent};
use crate::models::{ConnectivityState, NetworkStatus};

pub use probe::{HttpReachabilityProbe, ReachabilityProbe};

const TRANSITION_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
struct MonitorState {
    status: NetworkStatus,
    consecutive_failures: u32,
}

struct Inner<P> {
    probe: P,
    clock: SharedClock,
    events: EventBus,
    poll_interval: Duration,
    offline_after_failures: u32,
    state: Mutex<MonitorState>,
    check_lock: tokio::sync::Mutex<()>,
    transitions: broadcast::Sender<NetworkStatus>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Connectivity monitor
pub struct ConnectivityMonitor<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ConnectivityMonitor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ReachabilityProbe> ConnectivityMonitor<P> {
    pub fn new(
        probe: P,
        clock: SharedClock,
        events: EventBus,
        poll_interval: Duration,
        offline_after_failures: u32,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                probe,
                clock,
                events,
                poll_interval,
                offline_after_failures: offline_after_failures.max(1),
                state: Mutex::new(MonitorState::default()),
                check_lock: tokio::sync::Mutex::new(()),
                transitions,
                poller: Mutex::new(None),
            }),
        }
    }

    /// Last known status, without probing.
    pub fn status(&self) -> NetworkStatus {
        lock(&self.inner.state).status
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatus> {
        self.inner.transitions.subscribe()
    }

    /// Check right away, outside the poll schedule. Never fails; an
    /// unreachable server is reported through the returned status.
    pub async fn ping(&self) -> NetworkStatus {
        self.check().await
    }

    /// Run a first check and start polling.
    pub async fn initialize(&self) -> NetworkStatus {
        let status = self.check().await;

        let weak = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = Self::from_weak(&weak) else {
                    break;
                };
                monitor.check().await;
            }
        });

        if let Some(previous) = lock(&self.inner.poller).replace(handle) {
            previous.abort();
        }
        tracing::info!(
            state = %status.state,
            poll_interval_ms = poll_interval.as_millis(),
            "Connectivity monitor started"
        );
        status
    }

    /// Stop polling. The last status stays readable.
    pub fn cleanup(&self) {
        if let Some(handle) = lock(&self.inner.poller).take() {
            handle.abort();
            tracing::debug!("Connectivity monitor stopped");
        }
    }

    fn from_weak(inner: &Weak<Inner<P>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    async fn check(&self) -> NetworkStatus {
        let inner = &self.inner;
        let _serialized = inner.check_lock.lock().await;

        let interface_up = inner.probe.interface_up();
        let reachable = interface_up && inner.probe.probe().await;

        let (status, changed) = {
            let mut state = lock(&inner.state);
            let next = if !interface_up {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                ConnectivityState::Offline
            } else if reachable {
                state.consecutive_failures = 0;
                ConnectivityState::Online
            } else {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let was_connected = matches!(
                    state.status.state,
                    ConnectivityState::Online | ConnectivityState::Reconnecting
                );
                if was_connected && state.consecutive_failures < inner.offline_after_failures {
                    ConnectivityState::Reconnecting
                } else {
                    ConnectivityState::Offline
                }
            };

            let status = NetworkStatus {
                state: next,
                server_reachable: reachable,
                last_checked_at: inner.clock.now_ms(),
            };
            let changed = !state.status.same_state(&status);
            state.status = status;
            (status, changed)
        };

        if changed {
            tracing::info!(
                state = %status.state,
                server_reachable = status.server_reachable,
                "Connectivity changed"
            );
            // No receivers is fine.
            let _ = inner.transitions.send(status);
            inner.events.publish(SyncEvent::NetworkStatusChanged(status));
        } else {
            tracing::trace!(state = %status.state, "Connectivity unchanged");
        }
        status
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
