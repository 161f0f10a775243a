//! The per-event path from a source callback into the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dedup::Deduplicator;
use crate::dispatcher::Dispatcher;
use crate::normalize::normalize;
use crate::record::RawEvent;
use crate::source::EventCallback;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub submitted: u64,
}

/// Normalizes, deduplicates and submits raw events.
///
/// Every step is synchronous so [`Ingestor::handle`] is safe to call from a
/// platform delivery thread.
pub struct Ingestor {
    dispatcher: Arc<Dispatcher>,
    dedup: Deduplicator,
    received: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    submitted: AtomicU64,
}

impl Ingestor {
    pub fn new(dispatcher: Arc<Dispatcher>, dedup_capacity: usize) -> Self {
        Self {
            dispatcher,
            dedup: Deduplicator::new(dedup_capacity),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, raw: RawEvent) {
        self.received.fetch_add(1, Ordering::Relaxed);

        let record = match normalize(&raw) {
            Ok(record) => record,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(source = %raw.source(), error = %e, "dropping malformed event");
                return;
            }
        };

        let key = record.idempotency_key();
        if !self.dedup.first_sighting(&key) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(source = %record.source(), key = %key, "duplicate event ignored");
            return;
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.submit(record);
    }

    /// Wrap `self` as the callback handed to every source.
    pub fn callback(self: &Arc<Self>) -> EventCallback {
        let ingestor = self.clone();
        Arc::new(move |raw| ingestor.handle(raw))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
        }
    }
}
