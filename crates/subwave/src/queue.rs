// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable, viewable, removable priority queue of alerts.
//!
//! A min-heap ordered by [`alert_cmp`] with a parallel `item_id -> Alert` map
//! so entries can be inspected and removed from outside without knowing their
//! priority tuple. The queue snapshots to storage after every mutation and is
//! restored on startup, so in-flight alerts survive restarts.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertRegistry, BotCx};
use crate::error::Result;
use crate::storage::Storage;

/// How long the worker blocks on an empty queue before rechecking the pause
/// flag and cancellation.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Dispatch order: priority asc, then timestamp asc, then message id.
pub fn alert_cmp(a: &Alert, b: &Alert) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.timestamp.total_cmp(&b.timestamp))
        .then_with(|| a.message_id.cmp(&b.message_id))
}

struct HeapEntry {
    item_id: String,
    alert: Alert,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        alert_cmp(&self.alert, &other.alert) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap pops the smallest tuple first.
    fn cmp(&self, other: &Self) -> Ordering {
        alert_cmp(&other.alert, &self.alert)
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    items: HashMap<String, Alert>,
}

pub struct AlertQueue {
    /// Storage name the snapshot is saved under.
    name: String,
    storage: Option<Arc<dyn Storage>>,
    inner: Mutex<QueueInner>,
    paused: AtomicBool,
    available: Notify,
}

impl AlertQueue {
    pub fn new(name: impl Into<String>, storage: Option<Arc<dyn Storage>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            storage,
            inner: Mutex::new(QueueInner::default()),
            paused: AtomicBool::new(false),
            available: Notify::new(),
        })
    }

    /// Push an alert. Returns the opaque item id it can be removed by.
    pub async fn put(&self, alert: Alert) -> Result<String> {
        let item_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        inner.items.insert(item_id.clone(), alert.clone());
        inner.heap.push(HeapEntry { item_id: item_id.clone(), alert });
        self.snapshot(&inner).await?;
        drop(inner);
        self.available.notify_one();
        Ok(item_id)
    }

    /// Pop the minimum entry, or `None` when empty.
    pub async fn get(&self) -> Result<Option<(String, Alert)>> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.heap.pop() else {
            return Ok(None);
        };
        inner.items.remove(&entry.item_id);
        self.snapshot(&inner).await?;
        Ok(Some((entry.item_id, entry.alert)))
    }

    /// Pop the minimum entry, waiting up to `timeout` for one to arrive.
    pub async fn get_wait(&self, timeout: Duration) -> Result<Option<(String, Alert)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(popped) = self.get().await? {
                return Ok(Some(popped));
            }
            let notified = self.available.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Remove a specific entry by its item id.
    ///
    /// Rebuilds the heap from the map; linear, fine at the expected scale of
    /// at most a few hundred entries.
    pub async fn remove(&self, item_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.items.remove(item_id).is_none() {
            return Ok(false);
        }
        let rebuilt: BinaryHeap<HeapEntry> = inner
            .items
            .iter()
            .map(|(id, alert)| HeapEntry { item_id: id.clone(), alert: alert.clone() })
            .collect();
        inner.heap = rebuilt;
        self.snapshot(&inner).await?;
        Ok(true)
    }

    /// Point-in-time snapshot of the queue in dispatch order.
    pub async fn contents(&self) -> Vec<(String, Alert)> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<(String, Alert)> =
            inner.items.iter().map(|(id, alert)| (id.clone(), alert.clone())).collect();
        entries.sort_by(|a, b| alert_cmp(&a.1, &b.1));
        entries
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    /// Hold all dispatch until [`resume`](Self::resume); items keep accumulating.
    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::Relaxed);
        self.available.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(AtomicOrdering::Relaxed)
    }

    /// Restore the queue from its storage snapshot.
    ///
    /// Entries are rebuilt as alerts with fresh item ids; an entry missing a
    /// priority gets its topic handler's default from `registry`.
    pub async fn load_state(&self, registry: &AlertRegistry) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let entries = storage.load_queue(&self.name).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        for value in &entries {
            let mut alert: Alert = match serde_json::from_value(value.clone()) {
                Ok(alert) => alert,
                Err(e) => {
                    tracing::warn!(err = %e, "skipping malformed queue snapshot entry");
                    continue;
                }
            };
            if value.get("priority").is_none() {
                alert.priority = registry.resolve(&alert.channel).priority();
            }
            let item_id = uuid::Uuid::new_v4().to_string();
            inner.items.insert(item_id.clone(), alert.clone());
            inner.heap.push(HeapEntry { item_id, alert });
        }
        tracing::info!(count = inner.items.len(), "restored queue from storage");
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Persist the current entries. Called with the lock held so snapshots
    /// are ordered exactly like the mutations that produced them.
    async fn snapshot(&self, inner: &QueueInner) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut alerts: Vec<&Alert> = inner.items.values().collect();
        alerts.sort_by(|a, b| alert_cmp(a, b));
        let entries: Vec<Value> = alerts
            .into_iter()
            .filter_map(|alert| serde_json::to_value(alert).ok())
            .collect();
        storage.save_queue(&self.name, &entries).await?;
        Ok(())
    }

    /// Dispatch loop: pop in priority order and run each alert's handler.
    ///
    /// Handler failures are logged and swallowed; the worker only exits on
    /// cancellation.
    pub async fn run_worker(
        self: Arc<Self>,
        registry: Arc<AlertRegistry>,
        cx: BotCx,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if self.is_paused() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(POP_TIMEOUT) => {}
                }
                continue;
            }

            let popped = tokio::select! {
                _ = cancel.cancelled() => return,
                popped = self.get_wait(POP_TIMEOUT) => popped,
            };
            let (item_id, alert) = match popped {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(err = %e, "queue pop failed");
                    continue;
                }
            };

            let handler = registry.resolve(&alert.channel);
            if let Err(e) = handler.process(&alert, &cx).await {
                tracing::error!(
                    channel = %alert.channel,
                    message_id = %alert.message_id,
                    err = %e,
                    "alert handler failed"
                );
            }
            tracing::debug!(item_id = %item_id, channel = %alert.channel, "alert dispatched");
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
