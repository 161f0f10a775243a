//! Start/stop control over the event sources.
//!
//! The manager is the only owner of subscription handles, so a source is never
//! left registered after `stop` returns and never registered twice by a
//! repeated `start`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use relay_core::LifecycleConfig;

use crate::ingest::Ingestor;
use crate::source::{EventSource, SourceError, SourceKind, SubscriptionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to start {kind} source: {source}")]
    SourceStart {
        kind: SourceKind,
        #[source]
        source: SourceError,
    },
}

type ActiveSubscription = (Arc<dyn EventSource>, SubscriptionHandle);

pub struct LifecycleManager {
    sources: Vec<Arc<dyn EventSource>>,
    ingestor: Arc<Ingestor>,
    stop_on_suspend: bool,
    state: watch::Sender<LifecycleState>,
    /// Held for the whole of `start` and `stop`, which serializes them.
    active: Mutex<Vec<ActiveSubscription>>,
    suspended: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        sources: Vec<Arc<dyn EventSource>>,
        ingestor: Arc<Ingestor>,
        config: &LifecycleConfig,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            sources,
            ingestor,
            stop_on_suspend: config.stop_on_suspend,
            state,
            active: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Register every source. On the first failure the sources already
    /// registered are released again and the error is returned.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if matches!(self.state(), LifecycleState::Running | LifecycleState::Starting) {
            return Ok(());
        }

        let mut active = self.active.lock().await;
        if self.state() != LifecycleState::Stopped {
            return Ok(());
        }
        self.set_state(LifecycleState::Starting);

        let callback = self.ingestor.callback();
        for source in &self.sources {
            match source.start(callback.clone()).await {
                Ok(handle) => {
                    info!(source = %source.kind(), subscription = handle.id(), "source started");
                    active.push((source.clone(), handle));
                }
                Err(e) => {
                    error!(source = %source.kind(), error = %e, "source failed to start, rolling back");
                    release_all(&mut active).await;
                    self.set_state(LifecycleState::Stopped);
                    return Err(LifecycleError::SourceStart {
                        kind: source.kind(),
                        source: e,
                    });
                }
            }
        }

        self.set_state(LifecycleState::Running);
        Ok(())
    }

    /// Unregister every source, then cancel pending retries. In-flight sends
    /// are allowed to finish. A stop issued while starting waits for the
    /// start to complete first.
    pub async fn stop(&self) {
        // An explicit stop overrides a pending resume.
        self.suspended.store(false, Ordering::SeqCst);
        self.stop_sources().await;
    }

    async fn stop_sources(&self) {
        if self.state() == LifecycleState::Stopped {
            return;
        }

        let mut active = self.active.lock().await;
        if self.state() != LifecycleState::Running {
            return;
        }
        self.set_state(LifecycleState::Stopping);

        release_all(&mut active).await;
        let cancelled = self.ingestor.dispatcher().cancel_pending().await;

        self.set_state(LifecycleState::Stopped);
        info!(cancelled, "pipeline stopped");
    }

    /// The host is being backgrounded.
    pub async fn on_suspend(&self) {
        if !self.stop_on_suspend || self.state() != LifecycleState::Running {
            return;
        }
        self.suspended.store(true, Ordering::SeqCst);
        self.stop_sources().await;
    }

    /// The host is back in the foreground; restarts only what `on_suspend` stopped.
    pub async fn on_resume(&self) -> Result<(), LifecycleError> {
        if !self.suspended.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.start().await
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "lifecycle transition");
        }
    }
}

async fn release_all(active: &mut Vec<ActiveSubscription>) {
    for (source, handle) in active.drain(..) {
        let id = handle.id();
        if let Err(e) = source.stop(handle).await {
            warn!(source = %source.kind(), subscription = id, error = %e, "failed to stop source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::collector::{Collector, DeliveryError};
    use crate::dispatcher::Dispatcher;
    use crate::record::{NormalizedRecord, SmsPayload};
    use crate::source::{EventCallback, LocalMailbox, LocalSmsPlatform, ScheduledScanSource, SmsEventSource};

    struct NullCollector;

    #[async_trait]
    impl Collector for NullCollector {
        async fn deliver(&self, _record: &NormalizedRecord, _key: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    /// Source that takes a while to register and counts its registrations.
    struct SlowSource {
        delay: Duration,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl SlowSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventSource for SlowSource {
        async fn start(&self, _on_event: EventCallback) -> Result<SubscriptionHandle, SourceError> {
            tokio::time::sleep(self.delay).await;
            let n = self.starts.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(SubscriptionHandle::new(n, SourceKind::Sms))
        }

        async fn stop(&self, _handle: SubscriptionHandle) -> Result<(), SourceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Sms
        }
    }

    fn ingestor() -> Arc<Ingestor> {
        let dispatcher = Arc::new(Dispatcher::builder(Arc::new(NullCollector)).build());
        Arc::new(Ingestor::new(dispatcher, 64))
    }

    fn sms() -> SmsPayload {
        SmsPayload {
            message_id: Some("m-1".into()),
            sender: Some("+15550001".into()),
            parts: vec!["hello".into()],
            timestamp_ms: Some(1_700_000_000_000),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let platform = Arc::new(LocalSmsPlatform::new(true));
        let manager = LifecycleManager::new(
            vec![Arc::new(SmsEventSource::new(platform.clone()))],
            ingestor(),
            &LifecycleConfig::default(),
        );

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        assert_eq!(platform.listener_count(), 1);

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(platform.listener_count(), 0);
    }

    #[tokio::test]
    async fn events_after_stop_are_not_submitted() {
        let platform = Arc::new(LocalSmsPlatform::new(true));
        let ingestor = ingestor();
        let manager = LifecycleManager::new(
            vec![Arc::new(SmsEventSource::new(platform.clone()))],
            ingestor.clone(),
            &LifecycleConfig::default(),
        );

        manager.start().await.unwrap();
        manager.stop().await;
        platform.deliver(sms());

        assert_eq!(ingestor.stats().received, 0);
        assert_eq!(ingestor.dispatcher().stats().submitted, 0);
    }

    #[tokio::test]
    async fn permission_failure_rolls_back_started_sources() {
        let platform = Arc::new(LocalSmsPlatform::new(true));
        let mailbox = Arc::new(LocalMailbox::new(false));
        let manager = LifecycleManager::new(
            vec![
                Arc::new(SmsEventSource::new(platform.clone())),
                Arc::new(ScheduledScanSource::with_timing(
                    mailbox,
                    Duration::ZERO,
                    Duration::from_millis(10),
                )),
            ],
            ingestor(),
            &LifecycleConfig::default(),
        );

        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::SourceStart {
                kind: SourceKind::MailScan,
                source: SourceError::PermissionDenied(_),
            }
        ));
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(platform.listener_count(), 0);
    }

    #[tokio::test]
    async fn stop_during_start_waits_then_stops() {
        let source = Arc::new(SlowSource::new(Duration::from_millis(50)));
        let manager = Arc::new(LifecycleManager::new(
            vec![source.clone()],
            ingestor(),
            &LifecycleConfig::default(),
        ));

        let mut states = manager.subscribe_state();
        let starter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start().await })
        };
        states
            .wait_for(|s| *s == LifecycleState::Starting)
            .await
            .unwrap();

        manager.stop().await;
        starter.await.unwrap().unwrap();

        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspend_keeps_running_by_default() {
        let source = Arc::new(SlowSource::new(Duration::ZERO));
        let manager = LifecycleManager::new(vec![source.clone()], ingestor(), &LifecycleConfig::default());

        manager.start().await.unwrap();
        manager.on_suspend().await;
        assert_eq!(manager.state(), LifecycleState::Running);
        manager.on_resume().await.unwrap();
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspend_stops_when_configured() {
        let source = Arc::new(SlowSource::new(Duration::ZERO));
        let config = LifecycleConfig {
            stop_on_suspend: true,
            ..LifecycleConfig::default()
        };
        let manager = LifecycleManager::new(vec![source.clone()], ingestor(), &config);

        manager.start().await.unwrap();
        manager.on_suspend().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);

        manager.on_resume().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        assert_eq!(source.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn explicit_stop_while_suspended_is_not_undone_by_resume() {
        let source = Arc::new(SlowSource::new(Duration::ZERO));
        let config = LifecycleConfig {
            stop_on_suspend: true,
            ..LifecycleConfig::default()
        };
        let manager = LifecycleManager::new(vec![source.clone()], ingestor(), &config);

        manager.start().await.unwrap();
        manager.on_suspend().await;
        manager.stop().await;
        manager.on_resume().await.unwrap();

        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
    }
}
