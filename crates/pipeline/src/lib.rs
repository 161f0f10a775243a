//! Event relay pipeline: platform sources, normalization, deduplication and
//! retried delivery to a remote collector.

pub mod backoff;
pub mod bridge;
pub mod collector;
pub mod dedup;
pub mod dispatcher;
pub mod ingest;
pub mod lifecycle;
pub mod normalize;
pub mod record;
pub mod source;

pub use backoff::Backoff;
pub use bridge::{Bridge, BridgeStats};
pub use collector::{Collector, DeliveryError, EventPayload, HttpCollector};
pub use dedup::Deduplicator;
pub use dispatcher::{
    DeliveryAttempt, DeliveryFailure, DispatchStats, Dispatcher, DispatcherBuilder,
};
pub use ingest::{IngestStats, Ingestor};
pub use lifecycle::{LifecycleError, LifecycleManager, LifecycleState};
pub use normalize::{normalize, ParseError};
pub use record::{MailMessage, NormalizedRecord, RawEvent, SmsPayload, Source};
pub use source::{EventCallback, EventSource, SourceError, SourceKind, SubscriptionHandle};
