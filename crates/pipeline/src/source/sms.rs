//! Push-delivered SMS source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{EventCallback, EventSource, SourceError, SourceKind, SubscriptionHandle};
use crate::record::{RawEvent, SmsPayload};

/// Listener registered with the platform's SMS receiver.
pub type SmsListener = Arc<dyn Fn(SmsPayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The platform's incoming-SMS broadcast.
pub trait SmsPlatform: Send + Sync {
    /// Whether the "receive SMS" capability has been granted.
    fn has_receive_permission(&self) -> bool;

    fn add_listener(&self, listener: SmsListener) -> Result<ListenerId, SourceError>;

    /// Returns `false` if the listener was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

struct Registration {
    listener: ListenerId,
    /// Read-held for the duration of every callback; `stop` write-locks it.
    active: Arc<RwLock<bool>>,
}

/// Adapts an [`SmsPlatform`] broadcast into [`RawEvent::Sms`] events.
pub struct SmsEventSource<P> {
    platform: Arc<P>,
    next_id: AtomicU64,
    registrations: Mutex<HashMap<u64, Registration>>,
}

impl<P: SmsPlatform> SmsEventSource<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self {
            platform,
            next_id: AtomicU64::new(1),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl<P: SmsPlatform + 'static> EventSource for SmsEventSource<P> {
    async fn start(&self, on_event: EventCallback) -> Result<SubscriptionHandle, SourceError> {
        if !self.platform.has_receive_permission() {
            return Err(SourceError::PermissionDenied("RECEIVE_SMS not granted".into()));
        }

        let active = Arc::new(RwLock::new(true));
        let gate = active.clone();
        let listener: SmsListener = Arc::new(move |payload: SmsPayload| {
            let open = gate.read().unwrap_or_else(PoisonError::into_inner);
            if *open {
                on_event(RawEvent::Sms(payload));
            }
        });
        let listener = self.platform.add_listener(listener)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Registration { listener, active });

        info!(subscription = id, "sms listener registered");
        Ok(SubscriptionHandle::new(id, SourceKind::Sms))
    }

    async fn stop(&self, handle: SubscriptionHandle) -> Result<(), SourceError> {
        let registration = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id())
            .ok_or(SourceError::UnknownHandle(handle.id()))?;

        // Waits for callbacks already running on other threads.
        *registration
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = false;
        if !self.platform.remove_listener(registration.listener) {
            debug!(subscription = handle.id(), "platform had already dropped the listener");
        }
        info!(subscription = handle.id(), "sms listener removed");
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Sms
    }
}

// ── LocalSmsPlatform ─────────────────────────────────────────────────

/// In-process SMS broadcast.
///
/// Stands in for the device receiver: whatever calls [`deliver`](Self::deliver)
/// (the stdin bridge, a test) plays the role of the OS.
pub struct LocalSmsPlatform {
    permission: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, SmsListener>>,
}

impl LocalSmsPlatform {
    pub fn new(permission_granted: bool) -> Self {
        Self {
            permission: AtomicBool::new(permission_granted),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    /// Fan `payload` out to every registered listener; returns how many ran.
    pub fn deliver(&self, payload: SmsPayload) -> usize {
        // Clone the listeners out so a callback may (un)register without deadlocking.
        let listeners: Vec<SmsListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in &listeners {
            listener(payload.clone());
        }
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SmsPlatform for LocalSmsPlatform {
    fn has_receive_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: SmsListener) -> Result<ListenerId, SourceError> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}
