//! Raw platform events and the canonical record they normalize into.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Sms,
    Mail,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Sms => "sms",
            Source::Mail => "mail",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An SMS as handed over by the platform receiver.
///
/// Multi-part messages carry one entry in `parts` per PDU, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmsPayload {
    pub message_id: Option<String>,
    /// Originating address of the first part.
    pub sender: Option<String>,
    #[serde(default)]
    pub parts: Vec<String>,
    /// Epoch millis at which the platform received the message.
    pub timestamp_ms: Option<i64>,
}

/// A mailbox message returned by a scheduled scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: Option<String>,
    /// Mailbox history position at which the message was added.
    #[serde(default)]
    pub history_id: u64,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub body_plain: Option<String>,
    pub snippet: Option<String>,
    pub internal_date_ms: Option<i64>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Platform-specific payload, consumed once by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RawEvent {
    Sms(SmsPayload),
    Mail(MailMessage),
}

impl RawEvent {
    pub fn source(&self) -> Source {
        match self {
            RawEvent::Sms(_) => Source::Sms,
            RawEvent::Mail(_) => Source::Mail,
        }
    }
}

/// Canonical, validated representation of an event ready for delivery.
///
/// Fields are private so a record cannot change after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    source: Source,
    received_at: DateTime<Utc>,
    sender: String,
    body: String,
    subject: Option<String>,
    platform_id: Option<String>,
}

impl NormalizedRecord {
    pub fn new(
        source: Source,
        received_at: DateTime<Utc>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            source,
            received_at,
            sender: sender.into(),
            body: body.into(),
            subject: None,
            platform_id: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attach the platform message id; it becomes the idempotency basis.
    pub fn with_platform_id(mut self, id: impl Into<String>) -> Self {
        self.platform_id = Some(id.into());
        self
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn platform_id(&self) -> Option<&str> {
        self.platform_id.as_deref()
    }

    /// Stable SHA-256 hex key the collector deduplicates on.
    ///
    /// Keyed by `source:platform_id` when the platform supplied an id,
    /// otherwise by the record content.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.platform_id {
            Some(id) => {
                hasher.update(self.source.as_str().as_bytes());
                hasher.update(b":");
                hasher.update(id.as_bytes());
            }
            None => {
                hasher.update(self.source.as_str().as_bytes());
                hasher.update(b"\n");
                hasher.update(self.received_at.timestamp_millis().to_string().as_bytes());
                hasher.update(b"\n");
                hasher.update(self.sender.as_bytes());
                hasher.update(b"\n");
                hasher.update(self.body.as_bytes());
            }
        }
        let digest = hasher.finalize();
        format!("{digest:x}")
    }
}
