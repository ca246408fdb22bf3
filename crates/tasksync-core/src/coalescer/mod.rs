//! Debounced, batched writes.
//!
//! `BatchCoalescer` buffers entries per key and persists them through a
//! `BatchSink` once the key has been quiet for the debounce delay. Each key
//! has at most one armed timer and at most one flush in flight. A failed flush
//! puts its entries back in front of anything recorded meanwhile. A key left
//! with no entries, no timer and no waiting flush is dropped.

mod activity;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

pub use activity::{ActivityLogger, ActivitySink};

/// Destination of flushed batches.
pub trait BatchSink<K, E>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist all `entries` of `key` in one operation.
    fn persist(&self, key: &K, entries: &[E]) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A flush failed; its entries are buffered again.
#[derive(Debug, Error)]
#[error("flush of batch {key} failed, {requeued} entries kept for retry: {source}")]
pub struct CoalesceError<K, S>
where
    K: fmt::Display + fmt::Debug,
    S: std::error::Error + 'static,
{
    pub key: K,
    pub requeued: usize,
    #[source]
    pub source: S,
}

struct Slot<E> {
    entries: Vec<E>,
    timer: Option<JoinHandle<()>>,
    /// Unique per arm, across keys, so a stale timer can tell it was replaced
    /// even after its slot was dropped and recreated
    generation: u64,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<E> Default for Slot<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            timer: None,
            generation: 0,
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

struct Inner<K, E, S> {
    sink: S,
    delay: Duration,
    slots: Mutex<HashMap<K, Slot<E>>>,
    next_generation: AtomicU64,
}

/// Per-key debounce buffer in front of a `BatchSink`
pub struct BatchCoalescer<K, E, S> {
    inner: Arc<Inner<K, E, S>>,
}

impl<K, E, S> Clone for BatchCoalescer<K, E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, E, S> BatchCoalescer<K, E, S>
where
    K: Eq + Hash + Clone + fmt::Display + fmt::Debug + Send + Sync + 'static,
    E: Send + Sync + 'static,
    S: BatchSink<K, E>,
{
    pub fn new(sink: S, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                delay,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<K, Slot<E>>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer `entry` and restart the key's debounce timer.
    pub fn record(&self, key: K, entry: E) {
        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_default();
        slot.entries.push(entry);

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let generation = slot.generation;
        let delay = self.inner.delay;
        let weak = Arc::downgrade(&self.inner);
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coalescer) = Self::from_weak(&weak) {
                coalescer.flush_due(key, generation).await;
            }
        }));
    }

    fn from_weak(inner: &Weak<Inner<K, E, S>>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    async fn flush_due(&self, key: K, generation: u64) {
        {
            let mut slots = self.slots();
            match slots.get_mut(&key) {
                // Detach so a concurrent record() cannot abort this flush.
                Some(slot) if slot.generation == generation && slot.timer.is_some() => {
                    slot.timer = None;
                }
                _ => return,
            }
        }

        if let Err(error) = self.flush(&key).await {
            tracing::warn!("Debounced flush failed: {error}");
        }
    }

    /// Cancel the key's timer and persist everything buffered for it.
    /// Returns the number of entries written.
    pub async fn flush(&self, key: &K) -> Result<usize, CoalesceError<K, S::Error>> {
        let flush_lock = {
            let slots = self.slots();
            match slots.get(key) {
                Some(slot) => Arc::clone(&slot.flush_lock),
                None => return Ok(0),
            }
        };
        let _in_flight = flush_lock.lock().await;

        let entries = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(key) else {
                return Ok(0);
            };
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut slot.entries)
        };
        if entries.is_empty() {
            self.release_if_idle(key, &flush_lock);
            return Ok(0);
        }

        match self.inner.sink.persist(key, &entries).await {
            Ok(()) => {
                tracing::debug!(key = %key, count = entries.len(), "Flushed batch");
                self.release_if_idle(key, &flush_lock);
                Ok(entries.len())
            }
            Err(source) => {
                let requeued = entries.len();
                let mut slots = self.slots();
                let slot = slots.entry(key.clone()).or_default();
                let mut restored = entries;
                restored.append(&mut slot.entries);
                slot.entries = restored;

                Err(CoalesceError {
                    key: key.clone(),
                    requeued,
                    source,
                })
            }
        }
    }

    /// Drop the key's slot when it holds nothing and no other flush holds
    /// its lock. Clones of `flush_lock` are only taken under the slots mutex,
    /// so the count is stable here: the slot's own handle plus the caller's.
    fn release_if_idle(&self, key: &K, flush_lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.slots();
        let idle = slots.get(key).is_some_and(|slot| {
            Arc::ptr_eq(&slot.flush_lock, flush_lock)
                && slot.entries.is_empty()
                && slot.timer.is_none()
                && Arc::strong_count(flush_lock) == 2
        });
        if idle {
            slots.remove(key);
        }
    }

    /// Flush every key in turn. Keeps going after a failure and returns the
    /// first error once all keys were attempted.
    pub async fn flush_all(&self) -> Result<usize, CoalesceError<K, S::Error>> {
        let keys: Vec<K> = self.slots().keys().cloned().collect();

        let mut flushed = 0;
        let mut first_error = None;
        for key in keys {
            match self.flush(&key).await {
                Ok(count) => flushed += count,
                Err(error) => {
                    tracing::warn!("{error}");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        first_error.map_or(Ok(flushed), Err)
    }

    /// Cancel every timer without flushing. Buffered entries stay in memory.
    pub fn dispose(&self) {
        let mut slots = self.slots();
        let mut cancelled = 0;
        for slot in slots.values_mut() {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
                cancelled += 1;
            }
        }
        tracing::debug!(cancelled, "Coalescer timers cancelled");
    }

    /// Entries buffered for `key`.
    pub fn pending_len(&self, key: &K) -> usize {
        self.slots().get(key).map_or(0, |slot| slot.entries.len())
    }

    pub fn has_timer(&self, key: &K) -> bool {
        self.slots()
            .get(key)
            .is_some_and(|slot| slot.timer.is_some())
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots().len()
    }
}
