//! Reliable delivery of normalized records to a [`Collector`].
//!
//! `submit` is fire-and-forget: records go onto a channel drained by a single
//! worker task, which is the only code that touches the delivery queue.
//! The worker sends records in arrival order through a pool of at most
//! `max_concurrent_sends` tasks. A failed send parks the record in its own
//! backoff timer so later records are never held up behind it. After
//! `max_attempts` failures the record is dropped and reported once through
//! the `on_delivery_failed` callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relay_core::DispatchConfig;

use crate::backoff::Backoff;
use crate::collector::{Collector, DeliveryError};
use crate::record::NormalizedRecord;

/// Called once for every record that exhausted its attempts.
pub type FailureCallback = Arc<dyn Fn(DeliveryFailure) + Send + Sync>;

/// Called with the record and the number of attempts it took.
pub type DeliveredCallback = Arc<dyn Fn(&NormalizedRecord, u32) + Send + Sync>;

/// A record moving through the retry loop.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub record: NormalizedRecord,
    pub idempotency_key: String,
    /// Sends started so far.
    pub attempt_count: u32,
    pub next_retry_at: Instant,
}

/// A record dropped after its last failed attempt.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub record: NormalizedRecord,
    pub idempotency_key: String,
    pub attempts: u32,
    pub last_error: DeliveryError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Submit(NormalizedRecord),
    Flush(oneshot::Sender<()>),
    CancelPending(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<usize>),
}

// ── DispatcherBuilder ────────────────────────────────────────────────

/// Fluent builder for a [`Dispatcher`].
pub struct DispatcherBuilder {
    collector: Arc<dyn Collector>,
    config: DispatchConfig,
    on_failed: Option<FailureCallback>,
    on_delivered: Option<DeliveredCallback>,
}

impl DispatcherBuilder {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self {
            collector,
            config: DispatchConfig::default(),
            on_failed: None,
            on_delivered: None,
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_delivery_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeliveryFailure) + Send + Sync + 'static,
    {
        self.on_failed = Some(Arc::new(callback));
        self
    }

    pub fn on_delivered<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NormalizedRecord, u32) + Send + Sync + 'static,
    {
        self.on_delivered = Some(Arc::new(callback));
        self
    }

    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn build(self) -> Dispatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = DispatchWorker {
            collector: self.collector,
            backoff: Backoff::from_config(&self.config),
            max_attempts: self.config.max_attempts.max(1),
            max_in_flight: self.config.max_concurrent_sends.max(1),
            ready: VecDeque::new(),
            in_flight: JoinSet::new(),
            retries: JoinSet::new(),
            epoch: 0,
            idle_waiters: Vec::new(),
            drain_waiters: Vec::new(),
            on_failed: self.on_failed,
            on_delivered: self.on_delivered,
            counters: counters.clone(),
        };

        info!(
            max_attempts = worker.max_attempts,
            max_concurrent_sends = worker.max_in_flight,
            base_backoff_ms = self.config.base_backoff_ms,
            max_backoff_ms = self.config.max_backoff_ms,
            "dispatcher started"
        );

        Dispatcher {
            tx,
            counters,
            worker: Mutex::new(Some(tokio::spawn(worker.run(rx)))),
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

/// Handle to the delivery worker.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn builder(collector: Arc<dyn Collector>) -> DispatcherBuilder {
        DispatcherBuilder::new(collector)
    }

    /// Queue a record for delivery. Never blocks.
    pub fn submit(&self, record: NormalizedRecord) {
        // Counted before the send so the worker never sees an uncounted record.
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(Command::Submit(record)) {
            Ok(()) => {}
            Err(mpsc::error::SendError(Command::Submit(record))) => {
                self.counters.submitted.fetch_sub(1, Ordering::Relaxed);
                warn!(
                    source = %record.source(),
                    "dispatcher is shut down, dropping record"
                );
            }
            Err(_) => {}
        }
    }

    /// Wait until every submitted record was delivered or dropped.
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drop queued attempts and pending retries, then wait for in-flight
    /// sends to finish. Returns the number of attempts cancelled.
    pub async fn cancel_pending(&self) -> usize {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::CancelPending(reply)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }

    /// Cancel pending work, wait for in-flight sends and stop the worker.
    pub async fn shutdown(&self) -> usize {
        let (reply, done) = oneshot::channel();
        let cancelled = if self.tx.send(Command::Shutdown(reply)).is_ok() {
            done.await.unwrap_or(0)
        } else {
            0
        };

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher worker ended abnormally");
            }
        }
        cancelled
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }
}

// ── Worker ───────────────────────────────────────────────────────────

struct SendOutcome {
    attempt: DeliveryAttempt,
    epoch: u64,
    result: Result<(), DeliveryError>,
}

struct DispatchWorker {
    collector: Arc<dyn Collector>,
    backoff: Backoff,
    max_attempts: u32,
    max_in_flight: usize,
    /// Attempts due now, in arrival order.
    ready: VecDeque<DeliveryAttempt>,
    in_flight: JoinSet<SendOutcome>,
    /// One sleeping task per record in backoff; yields the attempt when due.
    retries: JoinSet<DeliveryAttempt>,
    /// Bumped on every cancel; failures of sends started earlier are not retried.
    epoch: u64,
    idle_waiters: Vec<oneshot::Sender<()>>,
    drain_waiters: Vec<(oneshot::Sender<usize>, usize)>,
    on_failed: Option<FailureCallback>,
    on_delivered: Option<DeliveredCallback>,
    counters: Arc<Counters>,
}

impl DispatchWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut closing = false;

        loop {
            self.start_sends();
            self.notify_waiters();

            if closing && self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                command = rx.recv(), if !closing => match command {
                    Some(Command::Submit(record)) => self.enqueue(record),
                    Some(Command::Flush(reply)) => self.idle_waiters.push(reply),
                    Some(Command::CancelPending(reply)) => {
                        let cancelled = self.cancel_pending();
                        self.drain_waiters.push((reply, cancelled));
                    }
                    Some(Command::Shutdown(reply)) => {
                        let cancelled = self.cancel_pending() + self.close_inbox(&mut rx);
                        self.drain_waiters.push((reply, cancelled));
                        closing = true;
                    }
                    None => {
                        self.cancel_pending();
                        closing = true;
                    }
                },
                Some(joined) = self.in_flight.join_next() => self.on_send_complete(joined),
                Some(joined) = self.retries.join_next() => match joined {
                    Ok(attempt) => self.ready.push_back(attempt),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!(error = %e, "retry timer task failed"),
                },
            }
        }

        self.notify_waiters();
        info!(stats = ?self.counters.snapshot(), "dispatcher stopped");
    }

    /// Refuse further commands and settle the ones already queued behind the
    /// shutdown. Returns how many submitted records were dropped.
    fn close_inbox(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> usize {
        rx.close();
        let mut dropped = 0;
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Submit(record) => {
                    dropped += 1;
                    warn!(source = %record.source(), "dispatcher is shutting down, dropping record");
                }
                Command::Flush(reply) => self.idle_waiters.push(reply),
                Command::CancelPending(reply) | Command::Shutdown(reply) => {
                    self.drain_waiters.push((reply, 0));
                }
            }
        }
        self.counters
            .cancelled
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    fn enqueue(&mut self, record: NormalizedRecord) {
        let idempotency_key = record.idempotency_key();
        debug!(source = %record.source(), key = %idempotency_key, "record queued");
        self.ready.push_back(DeliveryAttempt {
            record,
            idempotency_key,
            attempt_count: 0,
            next_retry_at: Instant::now(),
        });
    }

    fn start_sends(&mut self) {
        while self.in_flight.len() < self.max_in_flight {
            let Some(mut attempt) = self.ready.pop_front() else {
                break;
            };
            attempt.attempt_count += 1;
            let collector = self.collector.clone();
            let epoch = self.epoch;
            self.in_flight.spawn(async move {
                let result = collector
                    .deliver(&attempt.record, &attempt.idempotency_key)
                    .await;
                SendOutcome {
                    attempt,
                    epoch,
                    result,
                }
            });
        }
    }

    fn on_send_complete(&mut self, joined: Result<SendOutcome, JoinError>) {
        let SendOutcome {
            mut attempt,
            epoch,
            result,
        } = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "send task panicked, record lost");
                return;
            }
        };

        let error = match result {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    source = %attempt.record.source(),
                    key = %attempt.idempotency_key,
                    attempts = attempt.attempt_count,
                    "record delivered"
                );
                if let Some(callback) = &self.on_delivered {
                    callback(&attempt.record, attempt.attempt_count);
                }
                return;
            }
            Err(e) => e,
        };

        if epoch != self.epoch {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            for (_, cancelled) in &mut self.drain_waiters {
                *cancelled += 1;
            }
            debug!(
                key = %attempt.idempotency_key,
                error = %error,
                "send failed after cancel, not retrying"
            );
            return;
        }

        if attempt.attempt_count >= self.max_attempts {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = %attempt.record.source(),
                key = %attempt.idempotency_key,
                attempts = attempt.attempt_count,
                error = %error,
                "delivery failed, giving up"
            );
            if let Some(callback) = &self.on_failed {
                callback(DeliveryFailure {
                    record: attempt.record,
                    idempotency_key: attempt.idempotency_key,
                    attempts: attempt.attempt_count,
                    last_error: error,
                });
            }
            return;
        }

        let delay = self.backoff.delay(attempt.attempt_count);
        attempt.next_retry_at = Instant::now() + delay;
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        warn!(
            key = %attempt.idempotency_key,
            attempt = attempt.attempt_count,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "delivery failed, retrying"
        );
        self.retries.spawn(async move {
            tokio::time::sleep_until(attempt.next_retry_at).await;
            attempt
        });
    }

    /// Drop everything not yet sent; returns how many attempts were dropped.
    fn cancel_pending(&mut self) -> usize {
        let cancelled = self.ready.len() + self.retries.len();
        self.ready.clear();
        // Dropping the set aborts every sleeping retry.
        self.retries = JoinSet::new();
        self.epoch += 1;
        self.counters
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        if cancelled > 0 {
            info!(cancelled, in_flight = self.in_flight.len(), "pending deliveries cancelled");
        }
        cancelled
    }

    fn notify_waiters(&mut self) {
        if !self.in_flight.is_empty() {
            return;
        }
        for (reply, cancelled) in self.drain_waiters.drain(..) {
            let _ = reply.send(cancelled);
        }
        if self.ready.is_empty() && self.retries.is_empty() {
            for reply in self.idle_waiters.drain(..) {
                let _ = reply.send(());
            }
        }
    }
}
