//! Timer-driven mailbox scan source.
//!
//! Every tick asks the [`Mailbox`] for messages added after the last seen
//! history position and emits them as [`RawEvent::Mail`]. Outgoing and
//! junk-folder messages are skipped. Scan errors are logged and the next
//! tick tries again; they never end the subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use relay_core::ScanConfig;

use super::{EventCallback, EventSource, SourceError, SourceKind, SubscriptionHandle};
use crate::record::{MailMessage, RawEvent};

/// Labels whose messages are never forwarded.
const SKIPPED_LABELS: &[&str] = &["SENT", "DRAFT", "SPAM", "TRASH"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox authorization missing or expired")]
    Unauthorized,

    #[error("history cursor {0} is no longer valid")]
    InvalidCursor(u64),

    #[error("mailbox unavailable: {0}")]
    Unavailable(String),
}

/// Messages added after a cursor, and the position to resume from.
#[derive(Debug, Clone, Default)]
pub struct MailboxBatch {
    pub messages: Vec<MailMessage>,
    pub history_id: u64,
}

/// Read access to a remote mailbox's change history.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn is_authorized(&self) -> bool;

    async fn fetch_since(&self, cursor: u64) -> Result<MailboxBatch, MailboxError>;

    /// Latest history position, used to resume after the cursor was rejected.
    async fn head(&self) -> Result<u64, MailboxError>;
}

struct ScanTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Periodically scans a [`Mailbox`].
///
/// The history cursor lives in the source, so a stop/start cycle resumes where
/// the previous subscription left off.
pub struct ScheduledScanSource<M> {
    mailbox: Arc<M>,
    initial_delay: Duration,
    interval: Duration,
    cursor: Arc<AtomicU64>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, ScanTask>>,
}

impl<M: Mailbox + 'static> ScheduledScanSource<M> {
    pub fn new(mailbox: Arc<M>, config: &ScanConfig) -> Self {
        Self::with_timing(mailbox, config.initial_delay(), config.interval())
    }

    pub fn with_timing(mailbox: Arc<M>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            mailbox,
            initial_delay,
            // tokio intervals panic on a zero period.
            interval: interval.max(Duration::from_millis(1)),
            cursor: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Resume from a previously persisted history position.
    pub fn starting_at(self, cursor: u64) -> Self {
        self.cursor.store(cursor, Ordering::SeqCst);
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Mailbox + 'static> EventSource for ScheduledScanSource<M> {
    async fn start(&self, on_event: EventCallback) -> Result<SubscriptionHandle, SourceError> {
        if !self.mailbox.is_authorized().await {
            return Err(SourceError::PermissionDenied("mailbox not linked".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_scan_loop(
            self.mailbox.clone(),
            self.cursor.clone(),
            on_event,
            self.initial_delay,
            self.interval,
            shutdown.clone(),
            id,
        ));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ScanTask { shutdown, handle });

        info!(
            subscription = id,
            interval_secs = self.interval.as_secs_f64(),
            "mailbox scan scheduled"
        );
        Ok(SubscriptionHandle::new(id, SourceKind::MailScan))
    }

    async fn stop(&self, handle: SubscriptionHandle) -> Result<(), SourceError> {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id())
            .ok_or(SourceError::UnknownHandle(handle.id()))?;

        task.shutdown.notify_one();
        if let Err(e) = task.handle.await {
            warn!(subscription = handle.id(), error = %e, "mailbox scan task ended abnormally");
        }
        info!(subscription = handle.id(), cursor = self.cursor(), "mailbox scan stopped");
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MailScan
    }
}

async fn run_scan_loop<M: Mailbox + ?Sized>(
    mailbox: Arc<M>,
    cursor: Arc<AtomicU64>,
    on_event: EventCallback,
    initial_delay: Duration,
    interval: Duration,
    shutdown: Arc<Notify>,
    subscription: u64,
) {
    tokio::select! {
        _ = shutdown.notified() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shutdown.notified() => break,
            emitted = scan_once(&*mailbox, &cursor, &on_event) => {
                debug!(subscription, emitted, "mailbox scan complete");
            }
        }
    }
}

/// Run one scan, returning how many events were emitted.
pub(crate) async fn scan_once<M: Mailbox + ?Sized>(
    mailbox: &M,
    cursor: &AtomicU64,
    on_event: &EventCallback,
) -> usize {
    let from = cursor.load(Ordering::SeqCst);
    match mailbox.fetch_since(from).await {
        Ok(batch) => {
            let mut emitted = 0;
            for message in batch.messages {
                if message.history_id != 0 && message.history_id <= from {
                    continue;
                }
                if is_skipped(&message) {
                    debug!(id = ?message.id, labels = ?message.labels, "skipping mail by label");
                    continue;
                }
                on_event(RawEvent::Mail(message));
                emitted += 1;
            }
            cursor.fetch_max(batch.history_id, Ordering::SeqCst);
            emitted
        }
        Err(MailboxError::InvalidCursor(rejected)) => {
            match mailbox.head().await {
                Ok(head) => {
                    warn!(rejected, head, "history cursor rejected, resuming from head");
                    cursor.store(head, Ordering::SeqCst);
                }
                Err(e) => warn!(rejected, error = %e, "history cursor rejected and head unavailable"),
            }
            0
        }
        Err(e) => {
            warn!(cursor = from, error = %e, "mailbox scan failed");
            0
        }
    }
}

fn is_skipped(message: &MailMessage) -> bool {
    message
        .labels
        .iter()
        .any(|label| SKIPPED_LABELS.contains(&label.as_str()))
}

// ── LocalMailbox ─────────────────────────────────────────────────────

#[derive(Default)]
struct LocalMailboxState {
    messages: Vec<MailMessage>,
    head: u64,
}

/// In-process mailbox with a monotonically increasing history position.
pub struct LocalMailbox {
    authorized: AtomicBool,
    state: Mutex<LocalMailboxState>,
}

impl LocalMailbox {
    pub fn new(authorized: bool) -> Self {
        Self {
            authorized: AtomicBool::new(authorized),
            state: Mutex::new(LocalMailboxState::default()),
        }
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Append a message, stamping it with the next history id.
    pub fn push(&self, mut message: MailMessage) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.head += 1;
        message.history_id = state.head;
        state.messages.push(message);
        state.head
    }
}

#[async_trait]
impl Mailbox for LocalMailbox {
    async fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    async fn fetch_since(&self, cursor: u64) -> Result<MailboxBatch, MailboxError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(MailboxError::Unauthorized);
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor > state.head {
            return Err(MailboxError::InvalidCursor(cursor));
        }
        Ok(MailboxBatch {
            messages: state
                .messages
                .iter()
                .filter(|m| m.history_id > cursor)
                .cloned()
                .collect(),
            history_id: state.head,
        })
    }

    async fn head(&self) -> Result<u64, MailboxError> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).head)
    }
}
