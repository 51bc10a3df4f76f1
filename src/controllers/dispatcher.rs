//! Control loop dispatcher
//!
//! Turns change notifications and periodic resyncs into reconcile passes.
//! Work is keyed by cluster: at most one pass per key is in flight, any number
//! of notifications arriving meanwhile collapse into one follow-up pass, and
//! failed passes are retried according to the error's retry policy.

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::config::{BackoffPolicy, OperatorConfig};
use crate::error::{backoff_delay, Result, RetryPolicy};
use crate::platform::{ClusterKey, Platform};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A single reconcile pass for one key
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ClusterKey) -> Result<ReconcileOutcome>;
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ClusterKey) -> Result<ReconcileOutcome> {
        Reconciler::reconcile(self, key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Queued,
    Reconciling,
    Backoff,
}

/// How a pass ended, as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    /// The cluster is gone; forget the key
    Gone,
    Failed(RetryPolicy),
}

#[derive(Debug)]
struct Entry {
    state: KeyState,
    /// A notification arrived while reconciling
    dirty: bool,
    /// Consecutive failures, reset on success
    failures: u32,
    /// Consecutive conflicts, reset by any other outcome
    conflicts: u32,
    /// Invalidates stale backoff timers
    epoch: u64,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: KeyState::Idle,
            dirty: false,
            failures: 0,
            conflicts: 0,
            epoch: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ClusterKey>,
    entries: HashMap<ClusterKey, Entry>,
    closed: bool,
}

/// Keyed work queue with per-key serialization and coalescing.
///
/// The lock is never held across an await.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// A delayed retry the caller must arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTimer {
    pub key: ClusterKey,
    pub epoch: u64,
    pub delay: Duration,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a change for `key`.
    pub fn enqueue(&self, key: ClusterKey) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let entry = state.entries.entry(key.clone()).or_insert_with(Entry::new);
        match entry.state {
            KeyState::Queued => return,
            KeyState::Reconciling => {
                entry.dirty = true;
                return;
            }
            KeyState::Idle | KeyState::Backoff => {
                entry.state = KeyState::Queued;
                entry.epoch += 1;
            }
        }
        state.ready.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key to work on. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<ClusterKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    if let Some(entry) = state.entries.get_mut(&key) {
                        entry.state = KeyState::Reconciling;
                        entry.dirty = false;
                    }
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish a pass. Returns a timer to arm when the key should be retried
    /// after a delay.
    pub fn complete(&self, key: &ClusterKey, completion: Completion) -> Option<RetryTimer> {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return None;
        };
        let dirty = std::mem::take(&mut entry.dirty);

        let delay = match completion {
            Completion::Succeeded | Completion::Gone => {
                entry.failures = 0;
                entry.conflicts = 0;
                None
            }
            Completion::Failed(policy) => {
                entry.failures = entry.failures.saturating_add(1);
                entry.conflicts = match policy {
                    RetryPolicy::Immediate => entry.conflicts.saturating_add(1),
                    _ => 0,
                };
                match policy {
                    RetryPolicy::Immediate
                        if entry.conflicts <= self.backoff.max_immediate_retries =>
                    {
                        Some(Duration::ZERO)
                    }
                    RetryPolicy::Immediate | RetryPolicy::Backoff => Some(backoff_delay(
                        self.backoff.base,
                        self.backoff.ceiling,
                        entry.failures,
                    )),
                    RetryPolicy::AwaitChange => None,
                }
            }
        };

        let requeue_now = dirty || delay == Some(Duration::ZERO);
        if requeue_now {
            entry.state = KeyState::Queued;
            entry.epoch += 1;
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
            return None;
        }

        match delay {
            Some(delay) => {
                entry.state = KeyState::Backoff;
                entry.epoch += 1;
                Some(RetryTimer {
                    key: key.clone(),
                    epoch: entry.epoch,
                    delay,
                })
            }
            None => {
                let forget = completion == Completion::Gone || entry.failures == 0;
                entry.state = KeyState::Idle;
                if forget {
                    state.entries.remove(key);
                }
                None
            }
        }
    }

    /// Fire a retry timer. Ignored when the key moved on since it was armed.
    pub fn retry(&self, timer: &RetryTimer) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let Some(entry) = state.entries.get_mut(&timer.key) else {
            return;
        };
        if entry.state != KeyState::Backoff || entry.epoch != timer.epoch {
            return;
        }
        entry.state = KeyState::Queued;
        state.ready.push_back(timer.key.clone());
        drop(state);
        self.notify.notify_one();
    }

    pub fn state_of(&self, key: &ClusterKey) -> KeyState {
        self.lock()
            .entries
            .get(key)
            .map_or(KeyState::Idle, |e| e.state)
    }

    pub fn failures(&self, key: &ClusterKey) -> u32 {
        self.lock().entries.get(key).map_or(0, |e| e.failures)
    }

    /// Stop handing out work; waiting workers return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// Drives reconcile passes from notifications, resyncs and retry timers
pub struct Dispatcher<R: Reconcile> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    workers: usize,
    resync_period: Duration,
}

impl<R: Reconcile> Dispatcher<R> {
    pub fn new(reconciler: Arc<R>, config: &OperatorConfig) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new(config.backoff)),
            workers: config.workers.max(1),
            resync_period: config.resync_period,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until `shutdown` is cancelled. In-flight passes finish before
    /// this returns.
    pub async fn run(self, platform: Arc<dyn Platform>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(worker(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                shutdown.clone(),
            ));
        }
        info!(workers = self.workers, "Dispatcher started");

        let mut events = platform.watch();
        let mut resync = tokio::time::interval(self.resync_period);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(key) => self.queue.enqueue(key),
                    None => {
                        warn!("Change notification stream ended");
                        break;
                    }
                },
                _ = resync.tick() => match platform.list_clusters().await {
                    Ok(keys) => {
                        debug!(count = keys.len(), "Periodic resync");
                        for key in keys {
                            self.queue.enqueue(key);
                        }
                    }
                    Err(e) => warn!(error = %e, "Resync listing failed"),
                },
            }
        }

        self.queue.close();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn worker<R: Reconcile>(
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    while let Some(key) = queue.next().await {
        let completion = match reconciler.reconcile(&key).await {
            Ok(ReconcileOutcome::NotFound) | Ok(ReconcileOutcome::Finalized) => Completion::Gone,
            Ok(ReconcileOutcome::Applied { .. }) => Completion::Succeeded,
            Err(e) => {
                debug!(worker = id, cluster = %key, error = %e, "Pass failed");
                Completion::Failed(e.retry_policy())
            }
        };
        if let Some(timer) = queue.complete(&key, completion) {
            debug!(cluster = %timer.key, delay = ?timer.delay, "Scheduling retry");
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(timer.delay) => queue.retry(&timer),
                }
            });
        }
    }
    debug!(worker = id, "Worker exiting");
}
