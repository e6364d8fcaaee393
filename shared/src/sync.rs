use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, UnixTimeMs};
use crate::connectivity::ConnectivityProbe;
use crate::model::{OperationKind, QueuedOperation, SyncFailure, SyncResult};
use crate::queue::{OperationQueue, QueueError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }
}

/// Classified failure returned by an operation handler.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} ({category:?})")]
pub struct ReplayError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ReplayError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ClientError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Business-layer replay of one kind of queued operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn replay(&self, operation: &QueuedOperation) -> Result<(), ReplayError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync aborted, queue storage failed: {0}")]
    Queue(#[from] QueueError),
}

type SyncOutcome = Result<SyncResult, SyncError>;

enum Role {
    Leader(watch::Sender<Option<SyncOutcome>>),
    Follower(watch::Receiver<Option<SyncOutcome>>),
}

/// Clears the in-flight slot when the leading pass ends or is dropped.
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<Option<SyncOutcome>>>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

/// Replays the operation queue while the probe reports online.
///
/// Only one pass runs at a time. A `sync()` issued while a pass is running
/// waits for that pass and returns its result.
pub struct SyncEngine {
    queue: Arc<OperationQueue>,
    probe: Arc<ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<OperationKind, Arc<dyn OperationHandler>>>,
    in_flight: Mutex<Option<watch::Receiver<Option<SyncOutcome>>>>,
    last_sync_at: Mutex<Option<UnixTimeMs>>,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<OperationQueue>,
        probe: Arc<ConnectivityProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            probe,
            clock,
            handlers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(None),
            last_sync_at: Mutex::new(None),
        }
    }

    /// Replaces any handler already registered for `kind`.
    pub fn register_handler(&self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(kind.clone(), handler).is_some() {
            debug!(%kind, "replaced operation handler");
        }
    }

    pub fn has_handler(&self, kind: &OperationKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(kind)
    }

    pub fn is_syncing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Completion time of the last pass that actually ran.
    pub fn last_sync_at(&self) -> Option<UnixTimeMs> {
        *lock(&self.last_sync_at)
    }

    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncResult, SyncError> {
        loop {
            match self.claim() {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        slot: &self.in_flight,
                    };
                    let outcome = self.run_pass().await;
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
                Role::Follower(mut rx) => {
                    debug!("sync already in flight, waiting for its result");
                    let finished = loop {
                        let current = rx.borrow_and_update().clone();
                        if current.is_some() {
                            break current;
                        }
                        if rx.changed().await.is_err() {
                            let last = rx.borrow().clone();
                            break last;
                        }
                    };
                    if let Some(outcome) = finished {
                        return outcome;
                    }
                    debug!("in-flight sync dropped before finishing, starting a new pass");
                }
            }
        }
    }

    fn claim(&self) -> Role {
        let mut slot = lock(&self.in_flight);
        match slot.as_ref() {
            Some(rx) => Role::Follower(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                *slot = Some(rx);
                Role::Leader(tx)
            }
        }
    }

    async fn run_pass(&self) -> SyncOutcome {
        if !self.probe.is_online() {
            info!("offline, skipping sync");
            return Ok(SyncResult::offline());
        }

        let snapshot = self.queue.list().await;
        let mut result = SyncResult::default();

        for operation in snapshot {
            result.attempted += 1;

            match self.replay_one(&operation).await {
                Ok(()) => {
                    match self.queue.dequeue(&operation.id).await {
                        Ok(_) => {}
                        // Discarded while the handler ran.
                        Err(QueueError::NotFound(_)) => {}
                        Err(e) => {
                            error!(
                                op_id = %operation.id,
                                "failed to dequeue replayed operation: {}", e
                            );
                            return Err(e.into());
                        }
                    }
                    result.succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        op_id = %operation.id,
                        resource = %operation.resource,
                        retryable = e.is_retryable(),
                        "replay failed: {}",
                        e.message
                    );
                    match self.queue.record_failure(&operation.id, e.message.clone()).await {
                        Ok(_) | Err(QueueError::NotFound(_)) => {}
                        Err(e) => {
                            error!(op_id = %operation.id, "failed to record replay failure: {}", e);
                            return Err(e.into());
                        }
                    }
                    result.failed += 1;
                    result.failures.push(SyncFailure {
                        operation_id: operation.id.clone(),
                        resource: operation.resource.clone(),
                        error: e.message,
                        retryable: e.category.is_retryable(),
                    });
                }
            }
        }

        *lock(&self.last_sync_at) = Some(self.clock.now());
        info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            "sync finished"
        );
        Ok(result)
    }

    async fn replay_one(&self, operation: &QueuedOperation) -> Result<(), ReplayError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&operation.kind)
            .cloned();

        match handler {
            Some(handler) => handler.replay(operation).await,
            None => Err(ReplayError::permanent(format!(
                "no handler registered for '{}'",
                operation.kind
            ))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
