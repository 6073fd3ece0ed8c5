//! # Async Dispatcher
//!
//! Bounded event queue drained by a pool of dispatch workers.
//!
//! ## Dispatch Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Dispatcher Flow                                  │
//! │                                                                         │
//! │  producers ──enqueue──► [ bounded mpsc queue (queue_capacity) ]         │
//! │                                      │                                  │
//! │                   ┌──────────────────┼──────────────────┐               │
//! │                   ▼                  ▼                  ▼               │
//! │               worker 1           worker 2    ...    worker N            │
//! │                   │                                                     │
//! │   1. take one task, plus up to batch_size-1 already queued              │
//! │   2. chain.select_endpoint()                                            │
//! │   3. auth.ensure_authenticated(endpoint)                                │
//! │   4. channel.send(batch) within send_timeout                            │
//! │                                                                         │
//! │   OUTCOMES                                                              │
//! │   ────────                                                              │
//! │   ok                 ──► delivered                                      │
//! │   transport/timeout  ──► endpoint Failed, attempt used, next endpoint   │
//! │   session expired    ──► session dropped, attempt used, retry           │
//! │   receiver busy      ──► endpoint Busy, retry, no attempt used          │
//! │   only busy left     ──► wait busy_backoff, no attempt used             │
//! │   no endpoint        ──► wait retry_backoff (or activation), attempt    │
//! │   attempts exhausted ──► dropped                                        │
//! │   not retryable      ──► dropped                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Enqueue Modes
//! - [`PublishMode::Blocking`] waits for capacity until shutdown begins.
//! - [`PublishMode::Timeout`] waits up to a deadline, then drops.
//! - [`PublishMode::NonBlocking`] never waits.
//!
//! Retries happen inside the worker that owns the batch. A failed batch is
//! never put back on the queue, so a full queue can not block its own
//! consumers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use databridge_core::Event;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthenticationManager;
use crate::config::TransportSettings;
use crate::error::AgentError;
use crate::failover::FailoverChain;

// =============================================================================
// Public Types
// =============================================================================

/// How `publish` treats a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Wait for capacity. Only shutdown cancels the wait.
    Blocking,
    /// Never wait.
    NonBlocking,
    /// Wait up to the given duration.
    Timeout(Duration),
}

/// Why an event was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No capacity within the allowed wait.
    QueueFull,
    /// The publisher is shutting down or closed.
    ShuttingDown,
}

/// Result of handing an event to the publisher.
///
/// Not being enqueued is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Enqueued,
    Dropped(DropReason),
}

impl PublishOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, PublishOutcome::Enqueued)
    }
}

/// One event waiting for delivery.
#[derive(Debug, Clone)]
pub struct PublishTask {
    pub event: Event,
    pub enqueued_at: Instant,
    pub attempts_left: u32,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Events accepted into the queue.
    pub enqueued: u64,
    /// Events not accepted (queue full or shutting down).
    pub rejected: u64,
    /// Events acknowledged by a receiver.
    pub delivered: u64,
    /// Accepted events given up on (attempts exhausted or shutdown).
    pub dropped: u64,
    /// Event retries (one per event per retry).
    pub retried: u64,
    /// Accepted events without a terminal outcome yet.
    pub pending: usize,
}

// =============================================================================
// Shared Worker State
// =============================================================================

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    pending: AtomicUsize,
}

struct Shared {
    chain: Arc<FailoverChain>,
    auth: Arc<AuthenticationManager>,
    settings: Arc<TransportSettings>,
    queue: Mutex<mpsc::Receiver<PublishTask>>,
    counters: Counters,
    drained: Notify,
    /// Stop accepting; idle workers exit once the queue is empty.
    closing: CancellationToken,
    /// Grace period over; workers abandon retries.
    hard_stop: CancellationToken,
}

impl Shared {
    /// Records a terminal outcome for `count` accepted events.
    fn settle(&self, count: usize, delivered: bool) {
        if count == 0 {
            return;
        }
        let counter = if delivered {
            &self.counters.delivered
        } else {
            &self.counters.dropped
        };
        counter.fetch_add(count as u64, Ordering::Relaxed);
        self.release_pending(count);
    }

    /// Lowers the pending count, waking flushers when it reaches zero.
    fn release_pending(&self, count: usize) {
        let previous = self
            .counters
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(count))
            })
            .unwrap_or(0);
        if previous <= count {
            self.drained.notify_waiters();
        }
    }
}

// =============================================================================
// Async Dispatcher
// =============================================================================

/// Bounded queue plus worker pool for one publisher.
pub struct AsyncDispatcher {
    tx: mpsc::Sender<PublishTask>,
    shared: Arc<Shared>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncDispatcher {
    /// Creates the queue and spawns `worker_count` workers.
    pub fn start(
        chain: Arc<FailoverChain>,
        auth: Arc<AuthenticationManager>,
        settings: Arc<TransportSettings>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let shared = Arc::new(Shared {
            chain,
            auth,
            settings: Arc::clone(&settings),
            queue: Mutex::new(rx),
            counters: Counters::default(),
            drained: Notify::new(),
            closing: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
        });

        let workers = (0..settings.worker_count)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared))))
            .collect();

        info!(
            transport = %settings.name,
            workers = settings.worker_count,
            queue_capacity = settings.queue_capacity,
            batch_size = settings.batch_size,
            "Dispatcher started"
        );

        AsyncDispatcher {
            tx,
            shared,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Offers an event to the queue.
    ///
    /// The event is stamped with the enqueue time unless it carries an
    /// explicit timestamp.
    pub async fn enqueue(&self, event: Event, mode: PublishMode) -> PublishOutcome {
        if self.shared.closing.is_cancelled() {
            return self.reject(DropReason::ShuttingDown);
        }

        let permit = match mode {
            PublishMode::NonBlocking => match self.tx.try_reserve() {
                Ok(permit) => Ok(permit),
                Err(mpsc::error::TrySendError::Full(())) => Err(DropReason::QueueFull),
                Err(mpsc::error::TrySendError::Closed(())) => Err(DropReason::ShuttingDown),
            },
            PublishMode::Blocking => tokio::select! {
                biased;
                _ = self.shared.closing.cancelled() => Err(DropReason::ShuttingDown),
                permit = self.tx.reserve() => permit.map_err(|_| DropReason::ShuttingDown),
            },
            PublishMode::Timeout(wait) => tokio::select! {
                biased;
                _ = self.shared.closing.cancelled() => Err(DropReason::ShuttingDown),
                permit = timeout(wait, self.tx.reserve()) => match permit {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(DropReason::ShuttingDown),
                    Err(_) => Err(DropReason::QueueFull),
                },
            },
        };

        let permit = match permit {
            Ok(permit) => permit,
            Err(reason) => return self.reject(reason),
        };
        // A slot freed by draining workers must not admit a task once
        // closing has begun.
        if self.shared.closing.is_cancelled() {
            drop(permit);
            return self.reject(DropReason::ShuttingDown);
        }

        // Counted before the send so flush() never sees the task as settled
        // while it sits in the queue.
        self.shared.counters.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        permit.send(PublishTask {
            event: event.stamped(Utc::now()),
            enqueued_at: Instant::now(),
            attempts_left: self.shared.settings.max_attempts,
        });
        PublishOutcome::Enqueued
    }

    fn reject(&self, reason: DropReason) -> PublishOutcome {
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(?reason, "Event not enqueued");
        PublishOutcome::Dropped(reason)
    }

    /// Waits until every accepted event has been delivered or dropped.
    pub async fn flush(&self) {
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.shared.counters.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Like [`flush`](Self::flush), bounded. Returns true if it drained.
    pub async fn flush_timeout(&self, wait: Duration) -> bool {
        timeout(wait, self.flush()).await.is_ok()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.shared.counters;
        DispatcherStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            pending: c.pending.load(Ordering::Acquire),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.is_cancelled()
    }

    /// Stops the dispatcher.
    ///
    /// ## Shutdown Sequence
    /// 1. Stop accepting and release producers waiting for capacity
    /// 2. Let workers drain the queue for up to `shutdown_grace`
    /// 3. Abandon retries; in-flight sends get `send_timeout` to finish
    /// 4. Count anything still queued as dropped
    pub async fn shutdown(&self) {
        let grace = self.shared.settings.shutdown_grace();
        self.shared.closing.cancel();

        if !self.flush_timeout(grace).await {
            warn!(
                pending = self.shared.counters.pending.load(Ordering::Acquire),
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period elapsed with events pending"
            );
        }
        self.shared.hard_stop.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now()
            + self.shared.settings.send_timeout()
            + self.shared.settings.connect_timeout();
        let mut aborted = false;
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Dispatch worker panicked");
                    aborted = true;
                }
                Err(_) => {
                    warn!("Dispatch worker did not stop in time, aborting");
                    worker.abort();
                    aborted = true;
                }
            }
        }

        let mut leftovers = 0usize;
        {
            let mut queue = self.shared.queue.lock().await;
            queue.close();
            while queue.try_recv().is_ok() {
                leftovers += 1;
            }
        }
        if leftovers > 0 {
            warn!(count = leftovers, "Dropping undelivered events at shutdown");
        }
        self.shared.settle(leftovers, false);

        // A worker that panicked or was aborted never settled its batch
        if aborted {
            let stuck = self.shared.counters.pending.swap(0, Ordering::AcqRel);
            self.shared.counters.dropped.fetch_add(stuck as u64, Ordering::Relaxed);
            self.shared.drained.notify_waiters();
        }

        info!(stats = ?self.stats(), "Dispatcher stopped");
    }
}

impl Drop for AsyncDispatcher {
    fn drop(&mut self) {
        if !self.shared.hard_stop.is_cancelled() {
            self.shared.closing.cancel();
            self.shared.hard_stop.cancel();
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Dispatch worker started");

    while let Some(batch) = next_batch(&shared).await {
        deliver(&shared, batch).await;
    }

    debug!(worker = id, "Dispatch worker stopped");
}

/// Takes one task, waiting if needed, plus whatever else is already queued
/// up to the batch size. `None` once closing and the queue is empty.
async fn next_batch(shared: &Shared) -> Option<Vec<PublishTask>> {
    if shared.hard_stop.is_cancelled() {
        return None;
    }

    let mut queue = shared.queue.lock().await;
    let first = tokio::select! {
        biased;
        task = queue.recv() => task,
        _ = shared.closing.cancelled() => queue.try_recv().ok(),
    }?;

    let mut batch = Vec::with_capacity(shared.settings.batch_size);
    batch.push(first);
    while batch.len() < shared.settings.batch_size {
        match queue.try_recv() {
            Ok(task) => batch.push(task),
            Err(_) => break,
        }
    }
    Some(batch)
}

/// Sends a batch, retrying in place until delivered or dropped.
async fn deliver(shared: &Shared, batch: Vec<PublishTask>) {
    let count = batch.len();
    let mut attempts_left = batch.iter().map(|t| t.attempts_left).min().unwrap_or(0);
    let oldest = batch.iter().map(|t| t.enqueued_at).min();
    let events: Vec<Event> = batch.into_iter().map(|t| t.event).collect();
    let send_timeout = shared.settings.send_timeout();

    loop {
        if shared.hard_stop.is_cancelled() {
            warn!(count, "Dropping batch, dispatcher stopped");
            shared.settle(count, false);
            return;
        }

        // Subscribed before selecting so an activation in between is not missed
        let activations = shared.chain.subscribe();
        let endpoint = match shared.chain.select_endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                // Busy receivers are backpressure, not failure
                if shared.chain.has_busy() {
                    shared.counters.retried.fetch_add(count as u64, Ordering::Relaxed);
                    wait_for_endpoint(shared, activations, shared.settings.busy_backoff()).await;
                    continue;
                }
                if !consume_attempt(shared, &mut attempts_left, count, &e) {
                    return;
                }
                wait_for_endpoint(shared, activations, shared.settings.retry_backoff()).await;
                continue;
            }
        };

        // Failed between selection and here; pick again.
        let Some((generation, channel)) = endpoint.channel() else {
            continue;
        };

        let session = match shared.auth.ensure_authenticated(&endpoint, generation).await {
            Ok(session) => session,
            Err(e) => {
                if !consume_attempt(shared, &mut attempts_left, count, &e) {
                    return;
                }
                continue;
            }
        };

        let result = match timeout(send_timeout, channel.send(&session, &events)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                operation: format!("send to {}", endpoint.receiver_url()),
                timeout: send_timeout,
            }),
        };

        match result {
            Ok(()) => {
                debug!(
                    endpoint = %endpoint.receiver_url(),
                    count,
                    latency_ms = oldest.map(|t| t.elapsed().as_millis() as u64),
                    "Batch delivered"
                );
                shared.settle(count, true);
                return;
            }
            Err(AgentError::ReceiverBusy(_)) => {
                endpoint.mark_busy(generation);
                shared.counters.retried.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e @ AgentError::SessionExpired(_)) => {
                shared.auth.invalidate(&endpoint, session.id()).await;
                if !consume_attempt(shared, &mut attempts_left, count, &e) {
                    return;
                }
            }
            Err(e) => {
                if e.is_endpoint_failure() {
                    endpoint.mark_failed(generation, &e);
                }
                if !consume_attempt(shared, &mut attempts_left, count, &e) {
                    return;
                }
            }
        }
    }
}

/// Uses one attempt. Returns false (and drops the batch) when none are left
/// or the error is not retryable.
fn consume_attempt(shared: &Shared, attempts_left: &mut u32, count: usize, error: &AgentError) -> bool {
    if !error.is_retryable() {
        warn!(count, error = %error, "Dropping batch, error is not retryable");
        shared.settle(count, false);
        return false;
    }

    *attempts_left = attempts_left.saturating_sub(1);
    if *attempts_left == 0 {
        warn!(count, error = %error, "Dropping batch, attempts exhausted");
        shared.settle(count, false);
        return false;
    }

    debug!(count, attempts_left = *attempts_left, error = %error, "Retrying batch");
    shared.counters.retried.fetch_add(count as u64, Ordering::Relaxed);
    true
}

/// Waits for an endpoint to become Active, at most `limit`.
///
/// Returns at once if an activation was signalled since `activations` was
/// subscribed.
async fn wait_for_endpoint(
    shared: &Shared,
    mut activations: watch::Receiver<u64>,
    limit: Duration,
) {
    tokio::select! {
        _ = sleep(limit) => {}
        _ = activations.changed() => {}
        _ = shared.hard_stop.cancelled() => {}
    }
}
