//! Remote collector client.
//!
//! Records are POSTed as JSON to `{collector_url}/events` together with their
//! idempotency key, so a redelivery after a crash is deduplicated server-side.

use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_core::CollectorConfig;

use crate::record::{NormalizedRecord, Source};

/// Transient delivery failure; the dispatcher retries on any of these.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collector unavailable: {0}")]
    Unavailable(String),
}

/// Destination for normalized records.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    /// Deliver one record. Must be idempotent for a given `idempotency_key`.
    async fn deliver(
        &self,
        record: &NormalizedRecord,
        idempotency_key: &str,
    ) -> Result<(), DeliveryError>;
}

/// Wire body of `POST /events`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload<'a> {
    pub source: Source,
    pub received_at: DateTime<Utc>,
    pub sender: &'a str,
    pub body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<&'a str>,
    pub idempotency_key: &'a str,
}

impl<'a> EventPayload<'a> {
    pub fn new(record: &'a NormalizedRecord, idempotency_key: &'a str) -> Self {
        Self {
            source: record.source(),
            received_at: record.received_at(),
            sender: record.sender(),
            body: record.body(),
            subject: record.subject(),
            idempotency_key,
        }
    }
}

/// Delivers records to the collector endpoint over HTTP.
#[derive(Debug)]
pub struct HttpCollector {
    /// Full `.../events` URL.
    endpoint: String,
    token: Option<String>,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl HttpCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            endpoint: events_endpoint(&config.url),
            token: config.token.clone(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Collector for HttpCollector {
    async fn deliver(
        &self,
        record: &NormalizedRecord,
        idempotency_key: &str,
    ) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", idempotency_key)
            .json(&EventPayload::new(record, idempotency_key));

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        // Only 200 and 201 acknowledge the record; anything else is retried.
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::warn!(
                url = %self.endpoint,
                %status,
                key = idempotency_key,
                "collector rejected record"
            );
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            url = %self.endpoint,
            %status,
            key = idempotency_key,
            "record delivered to collector"
        );
        Ok(())
    }
}

fn events_endpoint(base: &str) -> String {
    format!("{}/events", base.trim_end_matches('/'))
}
