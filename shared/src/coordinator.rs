//! Public facade over probe, queue and sync engine, plus the user
//! notification policy.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, TypedKvStore};
use crate::clock::{Clock, UnixTimeMs};
use crate::config::OfflineConfig;
use crate::connectivity::{ConnectivityPhase, ConnectivityProbe, ConnectivityState};
use crate::event::{ConnectivityEvent, Notifier, Subscription, Transition, UserNotification};
use crate::model::{NewOperation, OpId, OperationKind, QueuedOperation, SyncResult};
use crate::queue::{OperationQueue, QueueError};
use crate::sync::{OperationHandler, SyncEngine, SyncError};

pub const NOTIFICATION_TIMESTAMPS_KEY: &str = "notification_timestamps";
pub const OFFLINE_MODE_KEY: &str = "offline_mode";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("not online, sync rejected")]
    NotOnline,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("settings storage error: {0}")]
    Settings(#[from] KvError),
}

type NotificationTimes = BTreeMap<String, UnixTimeMs>;

pub struct OfflineCoordinator {
    config: OfflineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    probe: Arc<ConnectivityProbe>,
    queue: Arc<OperationQueue>,
    engine: Arc<SyncEngine>,
    notifier: Arc<dyn Notifier>,
    /// Probe events waiting for the notification policy.
    inbox: Arc<Mutex<VecDeque<ConnectivityEvent>>>,
    probe_subscription: Mutex<Option<Subscription>>,
    notification_times: tokio::sync::Mutex<NotificationTimes>,
    offline_mode: AtomicBool,
    settings_lock: tokio::sync::Mutex<()>,
}

impl OfflineCoordinator {
    /// Loads the queue and persisted settings and subscribes to the probe.
    #[instrument(skip_all)]
    pub async fn new(
        probe: Arc<ConnectivityProbe>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, CoordinatorError> {
        let config = probe.config().clone();

        let queue = Arc::new(
            OperationQueue::load(Arc::clone(&store), Arc::clone(&clock), config.max_queue_entries)
                .await?,
        );
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&queue),
            Arc::clone(&probe),
            Arc::clone(&clock),
        ));

        let notification_times = match times_store()
            .get(store.as_ref(), NOTIFICATION_TIMESTAMPS_KEY)
            .await
        {
            Ok(times) => times.unwrap_or_default(),
            Err(e) => {
                warn!("ignoring unreadable notification timestamps: {}", e);
                NotificationTimes::new()
            }
        };
        let offline_mode = match offline_mode_store()
            .get(store.as_ref(), OFFLINE_MODE_KEY)
            .await
        {
            Ok(mode) => mode.unwrap_or(false),
            Err(e) => {
                warn!("ignoring unreadable offline mode setting: {}", e);
                false
            }
        };

        let inbox = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Arc::clone(&inbox);
        let subscription = probe.subscribe(move |event: &ConnectivityEvent| {
            lock(&sink).push_back(*event);
        });

        let coordinator = Self {
            config,
            clock,
            store,
            probe,
            queue,
            engine,
            notifier,
            inbox,
            probe_subscription: Mutex::new(Some(subscription)),
            notification_times: tokio::sync::Mutex::new(notification_times),
            offline_mode: AtomicBool::new(offline_mode),
            settings_lock: tokio::sync::Mutex::new(()),
        };

        let pending = coordinator.queue.count().await;
        if pending > 0 {
            info!(pending, "recovered pending operations");
            coordinator
                .notifier
                .notify(&UserNotification::PendingOperations { count: pending });
        }

        Ok(coordinator)
    }

    /// Hosts read connectivity through `is_online`, `phase` and
    /// `connection_state`, and drive probes through `check_connectivity`.
    pub(crate) fn probe(&self) -> &Arc<ConnectivityProbe> {
        &self.probe
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn register_handler(&self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        self.engine.register_handler(kind, handler);
    }

    /// Reachable and not overridden by offline mode.
    pub fn is_online(&self) -> bool {
        !self.is_offline_mode_enabled() && self.probe.is_online()
    }

    pub fn phase(&self) -> ConnectivityPhase {
        self.probe.phase()
    }

    pub fn connection_state(&self) -> ConnectivityState {
        self.probe.snapshot()
    }

    pub fn is_offline_mode_enabled(&self) -> bool {
        self.offline_mode.load(Ordering::SeqCst)
    }

    /// Flips the override and persists it. Returns the new value.
    #[instrument(skip(self))]
    pub async fn toggle_offline_mode(&self) -> Result<bool, CoordinatorError> {
        let _settings = self.settings_lock.lock().await;
        let enabled = !self.offline_mode.load(Ordering::SeqCst);

        offline_mode_store()
            .set(self.store.as_ref(), OFFLINE_MODE_KEY, &enabled)
            .await?;
        self.offline_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "offline mode toggled");

        if !enabled && self.probe.is_online() {
            let pending = self.queue.count().await;
            if pending > 0 {
                self.notifier
                    .notify(&UserNotification::SyncPrompt { pending });
            }
        }

        Ok(enabled)
    }

    pub fn add_connectivity_listener<On, Off>(&self, on_online: On, on_offline: Off) -> Subscription
    where
        On: Fn() + Send + Sync + 'static,
        Off: Fn() + Send + Sync + 'static,
    {
        self.probe.add_connectivity_listener(on_online, on_offline)
    }

    #[instrument(skip(self, op), fields(kind = %op.kind, resource = %op.resource))]
    pub async fn enqueue_operation(&self, op: NewOperation) -> Result<OpId, CoordinatorError> {
        Ok(self.queue.enqueue(op).await?)
    }

    pub async fn pending_operations_count(&self) -> usize {
        self.queue.count().await
    }

    pub async fn pending_operations(&self) -> Vec<QueuedOperation> {
        self.queue.list().await
    }

    #[instrument(skip(self), fields(op_id = %id))]
    pub async fn discard_operation(&self, id: &OpId) -> Result<QueuedOperation, CoordinatorError> {
        Ok(self.queue.discard(id).await?)
    }

    /// Runs a (debounced) probe cycle, then applies the notification policy
    /// to whatever transitions it produced.
    #[instrument(skip(self))]
    pub async fn check_connectivity(&self) -> ConnectivityEvent {
        let event = self.probe.check().await;
        self.process_events().await;
        event
    }

    /// Drains pending probe events and applies the notification policy to
    /// the latest one. Returns the notifications that were shown.
    ///
    /// Earlier events in the inbox were superseded by later cycles, and the
    /// latest one is dropped too if the probe has moved on since. Nothing is
    /// shown while offline mode is on.
    pub async fn process_events(&self) -> Vec<UserNotification> {
        let latest = lock(&self.inbox).drain(..).last();
        let mut shown = Vec::new();

        let Some(event) = latest else {
            return shown;
        };
        if self.is_offline_mode_enabled() {
            debug!("offline mode on, ignoring connectivity transition");
            return shown;
        }
        if event.is_online() != self.probe.is_online() {
            debug!("stale connectivity transition dropped");
            return shown;
        }

        let transition = event.transition();
        if self.should_notify(transition).await {
            let banner = match transition {
                Transition::Online => UserNotification::Online,
                Transition::Offline => UserNotification::Offline,
            };
            self.notifier.notify(&banner);
            shown.push(banner);
        }

        if transition == Transition::Online {
            let pending = self.queue.count().await;
            if pending > 0 {
                // The user decides when deferred writes land.
                let prompt = UserNotification::SyncPrompt { pending };
                self.notifier.notify(&prompt);
                shown.push(prompt);
            }
        }

        shown
    }

    /// User-initiated sync. Rejected outright when not online.
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<SyncResult, CoordinatorError> {
        if !self.is_online() {
            debug!("sync requested while not online");
            return Err(CoordinatorError::NotOnline);
        }
        self.run_sync().await
    }

    /// Sync that reports an offline result instead of failing.
    #[instrument(skip(self))]
    pub async fn sync_offline_operations(&self) -> Result<SyncResult, CoordinatorError> {
        if !self.is_online() {
            return Ok(SyncResult::offline());
        }
        self.run_sync().await
    }

    /// Runs `check_connectivity` every `monitor_interval_ms` until the
    /// coordinator is dropped or the handle is aborted.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.monitor_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    debug!("coordinator dropped, stopping monitor");
                    break;
                };
                coordinator.check_connectivity().await;
            }
        })
    }

    async fn run_sync(&self) -> Result<SyncResult, CoordinatorError> {
        let result = self.engine.sync().await?;
        if result.attempted > 0 {
            self.notifier.notify(&UserNotification::SyncSummary {
                succeeded: result.succeeded,
                failed: result.failed,
            });
        }
        Ok(result)
    }

    /// Same-transition banners are shown at most once per suppression window.
    async fn should_notify(&self, transition: Transition) -> bool {
        let now = self.clock.now();
        let mut times = self.notification_times.lock().await;

        if let Some(last) = times.get(transition.as_str()) {
            if now.millis_since(*last) < self.config.notification_suppression_window_ms {
                debug!(%transition, "suppressing repeated notification");
                return false;
            }
        }

        times.insert(transition.as_str().to_string(), now);
        if let Err(e) = times_store()
            .set(self.store.as_ref(), NOTIFICATION_TIMESTAMPS_KEY, &times)
            .await
        {
            warn!("failed to persist notification timestamps: {}", e);
        }
        true
    }
}

impl Drop for OfflineCoordinator {
    fn drop(&mut self) {
        if let Some(subscription) = lock(&self.probe_subscription).take() {
            subscription.unsubscribe();
        }
    }
}

fn times_store() -> TypedKvStore<NotificationTimes> {
    TypedKvStore::new(KeyNamespace::Settings)
}

fn offline_mode_store() -> TypedKvStore<bool> {
    TypedKvStore::new(KeyNamespace::Settings)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
