//! Event source adapters.
//!
//! An [`EventSource`] wraps a platform delivery mechanism (a push callback for
//! SMS, a timer for mailbox scans) and turns what it delivers into
//! [`RawEvent`]s handed to a callback. Registration failures are reported by
//! `start`, never mid-stream.

pub mod mail;
pub mod sms;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::record::RawEvent;

pub use mail::{LocalMailbox, Mailbox, MailboxBatch, MailboxError, ScheduledScanSource};
pub use sms::{ListenerId, LocalSmsPlatform, SmsEventSource, SmsListener, SmsPlatform};

/// Callback invoked for every event the platform delivers.
///
/// Runs on the platform's delivery thread and must not block.
pub type EventCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Sms,
    MailScan,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Sms => f.write_str("sms"),
            SourceKind::MailScan => f.write_str("mail-scan"),
        }
    }
}

/// Token for one active registration, returned by [`EventSource::start`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: SourceKind,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, kind: SourceKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no active subscription with id {0}")]
    UnknownHandle(u64),

    #[error("platform registration failed: {0}")]
    Registration(String),
}

/// A platform-backed producer of raw events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Register with the platform. Fails with [`SourceError::PermissionDenied`]
    /// when the capability was not granted.
    async fn start(&self, on_event: EventCallback) -> Result<SubscriptionHandle, SourceError>;

    /// Unregister. Once this returns, `on_event` is never invoked again for
    /// this handle.
    async fn stop(&self, handle: SubscriptionHandle) -> Result<(), SourceError>;

    fn kind(&self) -> SourceKind;
}
