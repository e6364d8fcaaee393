use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{info, warn};

// --- Connectivity events ---

/// Emitted only when the externally visible online flag flips.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub internet_reachable: bool,
    pub backend_reachable: bool,
}

impl ConnectivityEvent {
    pub fn is_online(&self) -> bool {
        self.internet_reachable && self.backend_reachable
    }

    pub fn transition(&self) -> Transition {
        if self.is_online() {
            Transition::Online
        } else {
            Transition::Offline
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Online,
    Offline,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Online => "online",
            Transition::Offline => "offline",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Listener registry ---

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct RegistryInner<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Observer list with explicit subscribe/unsubscribe handles.
///
/// Listeners run synchronously on the emitting task, outside the registry
/// lock, so a listener may subscribe or unsubscribe while being notified.
pub struct ListenerRegistry<E> {
    inner: Arc<Mutex<RegistryInner<E>>>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<RegistryInner<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Box::new(move |id| match weak.upgrade() {
                Some(inner) => {
                    let mut inner = lock(&inner);
                    let before = inner.listeners.len();
                    inner.listeners.retain(|(lid, _)| *lid != id);
                    inner.listeners.len() != before
                }
                None => false,
            }),
        }
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("listener registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Handle returned by `subscribe`. Dropping it leaves the listener attached;
/// call `unsubscribe` to detach.
pub struct Subscription {
    id: u64,
    remove: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns false if the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        (self.remove)(self.id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// --- User-facing notifications ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserNotification {
    /// "You are online" banner.
    Online,
    /// "You are offline" banner.
    Offline,
    /// Back online with deferred writes; the user decides when to sync.
    SyncPrompt { pending: usize },
    /// Recovered queue is non-empty at startup.
    PendingOperations { count: usize },
    /// Post-sync summary, never the raw error trace.
    SyncSummary { succeeded: usize, failed: usize },
}

impl UserNotification {
    pub fn notification_type(&self) -> &'static str {
        match self {
            UserNotification::Online => "online",
            UserNotification::Offline => "offline",
            UserNotification::SyncPrompt { .. } => "sync_prompt",
            UserNotification::PendingOperations { .. } => "pending_operations",
            UserNotification::SyncSummary { .. } => "sync_summary",
        }
    }
}

/// Host-side sink for banners, prompts and summaries.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &UserNotification);
}

/// Notifier for headless hosts: writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &UserNotification) {
        info!(kind = notification.notification_type(), ?notification, "user notification");
    }
}
