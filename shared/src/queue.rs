use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::clock::{Clock, UnixTimeMs};
use crate::model::{NewOperation, OpId, QueuedOperation};

pub const QUEUE_KEY: &str = "operations";
pub const QUARANTINE_KEY: &str = "quarantine";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] KvError),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("queue is full ({0} entries)")]
    Full(usize),
}

/// A persisted record that could not be decoded at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub raw: serde_json::Value,
    pub reason: String,
    pub detected_at: UnixTimeMs,
}

struct QueueState {
    /// Kept ordered by `created_at`, insertion order among equal timestamps.
    entries: Vec<QueuedOperation>,
    quarantined: Vec<QuarantinedRecord>,
}

/// Durable FIFO of deferred operations.
///
/// The whole queue is one JSON array under `outbox:operations`. Every
/// mutation updates memory first, then persists under the same write guard,
/// and rolls memory back if the persist fails.
pub struct OperationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    queue_key: String,
    quarantine_key: String,
    state: RwLock<QueueState>,
}

impl OperationQueue {
    /// Loads the persisted queue, dropping only the records that fail to
    /// decode. Fails only when the store itself cannot be read.
    #[instrument(skip(store, clock))]
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        max_entries: usize,
    ) -> Result<Self, QueueError> {
        let queue_key = KvKey::new(KeyNamespace::Outbox, QUEUE_KEY)?.raw();
        let quarantine_key = KvKey::new(KeyNamespace::Outbox, QUARANTINE_KEY)?.raw();
        let now = clock.now();

        let (entries, quarantined) = match store.get(&queue_key).await? {
            Some(bytes) => decode_queue(&bytes, now),
            None => (Vec::new(), Vec::new()),
        };

        let queue = Self {
            store,
            clock,
            max_entries,
            queue_key,
            quarantine_key,
            state: RwLock::new(QueueState {
                entries,
                quarantined,
            }),
        };

        let state = queue.state.read().await;
        if !state.quarantined.is_empty() {
            warn!(
                quarantined = state.quarantined.len(),
                "queue loaded with quarantined records"
            );
            // Keep the bad records around for inspection, and rewrite the
            // queue blob so it only holds decodable entries.
            if let Err(e) = queue.persist_quarantine(&state.quarantined).await {
                warn!("failed to persist quarantined records: {}", e);
            }
            if let Err(e) = queue.persist(&state.entries).await {
                warn!("failed to rewrite recovered queue: {}", e);
            }
        }
        info!(
            "operation queue loaded with {} entries, {} quarantined",
            state.entries.len(),
            state.quarantined.len()
        );
        drop(state);

        Ok(queue)
    }

    #[instrument(skip(self, op), fields(kind = %op.kind, resource = %op.resource))]
    pub async fn enqueue(&self, op: NewOperation) -> Result<OpId, QueueError> {
        let mut state = self.state.write().await;

        if state.entries.len() >= self.max_entries {
            warn!(max = self.max_entries, "queue full, rejecting operation");
            return Err(QueueError::Full(self.max_entries));
        }

        let entry = QueuedOperation::from_new(op, self.clock.now());
        let id = entry.id.clone();
        let pos = state
            .entries
            .partition_point(|e| e.created_at <= entry.created_at);

        // Memory first
        state.entries.insert(pos, entry);

        // Then persist - rollback on failure
        if let Err(e) = self.persist(&state.entries).await {
            state.entries.remove(pos);
            error!("failed to persist enqueued operation: {}", e);
            return Err(e);
        }

        info!(op_id = %id, pending = state.entries.len(), "operation queued");
        Ok(id)
    }

    /// Removes an entry after a successful replay.
    #[instrument(skip(self), fields(op_id = %id))]
    pub async fn dequeue(&self, id: &OpId) -> Result<QueuedOperation, QueueError> {
        self.remove_entry(id).await
    }

    /// Removes an entry the user chose not to replay.
    #[instrument(skip(self), fields(op_id = %id))]
    pub async fn discard(&self, id: &OpId) -> Result<QueuedOperation, QueueError> {
        let removed = self.remove_entry(id).await?;
        info!(resource = %removed.resource, "operation discarded");
        Ok(removed)
    }

    /// Bumps `attempts` and records the error. The entry keeps its place.
    #[instrument(skip(self, error), fields(op_id = %id))]
    pub async fn record_failure(
        &self,
        id: &OpId,
        error: impl Into<String>,
    ) -> Result<QueuedOperation, QueueError> {
        let mut state = self.state.write().await;

        let pos = state
            .entries
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let previous = state.entries[pos].clone();
        {
            let entry = &mut state.entries[pos];
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_attempt_error = Some(error.into());
        }

        if let Err(e) = self.persist(&state.entries).await {
            state.entries[pos] = previous;
            error!("failed to persist replay failure: {}", e);
            return Err(e);
        }

        Ok(state.entries[pos].clone())
    }

    /// FIFO snapshot ordered by `created_at`.
    pub async fn list(&self) -> Vec<QueuedOperation> {
        self.state.read().await.entries.clone()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn get(&self, id: &OpId) -> Option<QueuedOperation> {
        self.state
            .read()
            .await
            .entries
            .iter()
            .find(|e| &e.id == id)
            .cloned()
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.state.read().await.quarantined.clone()
    }

    async fn remove_entry(&self, id: &OpId) -> Result<QueuedOperation, QueueError> {
        let mut state = self.state.write().await;

        let pos = state
            .entries
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let removed = state.entries.remove(pos);

        if let Err(e) = self.persist(&state.entries).await {
            state.entries.insert(pos, removed);
            error!("failed to persist queue after removal: {}", e);
            return Err(e);
        }

        Ok(removed)
    }

    async fn persist(&self, entries: &[QueuedOperation]) -> Result<(), QueueError> {
        let bytes =
            serde_json::to_vec(entries).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.set(&self.queue_key, bytes).await?;
        Ok(())
    }

    async fn persist_quarantine(&self, records: &[QuarantinedRecord]) -> Result<(), QueueError> {
        let mut all: Vec<QuarantinedRecord> = match self.store.get(&self.quarantine_key).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(existing) => existing,
                Err(e) => {
                    // Carry the unreadable blob forward as a record of its own.
                    warn!("existing quarantine blob is unreadable: {}", e);
                    let raw = String::from_utf8_lossy(&bytes).into_owned();
                    vec![QuarantinedRecord {
                        raw: serde_json::Value::String(raw),
                        reason: format!("unreadable quarantine blob: {e}"),
                        detected_at: self.clock.now(),
                    }]
                }
            },
            None => Vec::new(),
        };
        all.extend(records.iter().cloned());
        let bytes =
            serde_json::to_vec(&all).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store.set(&self.quarantine_key, bytes).await?;
        Ok(())
    }
}

/// Partial recovery: each array element decodes on its own.
fn decode_queue(bytes: &[u8], now: UnixTimeMs) -> (Vec<QueuedOperation>, Vec<QuarantinedRecord>) {
    let mut entries: Vec<QueuedOperation> = Vec::new();
    let mut quarantined = Vec::new();
    let mut seen: HashSet<OpId> = HashSet::new();

    let items: Vec<serde_json::Value> = match serde_json::from_slice(bytes) {
        Ok(items) => items,
        Err(e) => {
            warn!("queue blob is not a JSON array, quarantining it whole: {}", e);
            quarantined.push(QuarantinedRecord {
                raw: serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
                reason: e.to_string(),
                detected_at: now,
            });
            return (entries, quarantined);
        }
    };

    for item in items {
        match serde_json::from_value::<QueuedOperation>(item.clone()) {
            Ok(op) if seen.contains(&op.id) => {
                warn!(op_id = %op.id, "quarantining duplicate queue entry");
                quarantined.push(QuarantinedRecord {
                    raw: item,
                    reason: format!("duplicate operation id {}", op.id),
                    detected_at: now,
                });
            }
            Ok(op) => {
                seen.insert(op.id.clone());
                entries.push(op);
            }
            Err(e) => {
                warn!("quarantining corrupted queue entry: {}", e);
                quarantined.push(QuarantinedRecord {
                    raw: item,
                    reason: e.to_string(),
                    detected_at: now,
                });
            }
        }
    }

    entries.sort_by_key(|e| e.created_at);
    (entries, quarantined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps a memory store and fails writes on demand.
    struct FailableStore {
        inner: MemoryKvStore,
        fail_writes: AtomicBool,
    }

    impl FailableStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryKvStore::new(),
                fail_writes: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for FailableStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(KvError::storage(
                    crate::capabilities::kv::StorageErrorCode::DiskFull,
                    "disk full",
                ));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool, KvError> {
            self.inner.remove(key).await
        }
    }

    fn make_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)))
    }

    async fn stored_entries(store: &dyn KeyValueStore) -> Vec<QueuedOperation> {
        let bytes = store.get("outbox:operations").await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_list_shows_fresh_entry() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();

        let id = queue
            .enqueue(NewOperation::create("materials", json!({"name": "rebar"})))
            .await
            .unwrap();

        let listed = queue.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].attempts, 0);
        assert_eq!(queue.count().await, 1);
        assert_eq!(stored_entries(store.as_ref()).await, listed);
    }

    #[tokio::test]
    async fn list_is_fifo_by_created_at() {
        let clock = make_clock();
        let queue = OperationQueue::load(Arc::new(MemoryKvStore::new()), clock.clone(), 100)
            .await
            .unwrap();

        let a = queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();
        clock.advance_ms(10);
        let b = queue.enqueue(NewOperation::update("b", json!({}))).await.unwrap();
        // Clock stepped backwards: entry still lands in timestamp order.
        clock.set(UnixTimeMs(1_700_000_000_005));
        let c = queue.enqueue(NewOperation::delete("c", json!({}))).await.unwrap();

        let ids: Vec<_> = queue.list().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, c, b]);
    }

    #[tokio::test]
    async fn dequeue_removes_and_persists() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();
        let id = queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();

        let removed = queue.dequeue(&id).await.unwrap();

        assert_eq!(removed.id, id);
        assert_eq!(queue.count().await, 0);
        assert!(stored_entries(store.as_ref()).await.is_empty());
        assert!(matches!(queue.dequeue(&id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn record_failure_bumps_attempts_in_place() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();
        let id = queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();

        queue.record_failure(&id, "503").await.unwrap();
        let updated = queue.record_failure(&id, "timeout").await.unwrap();

        assert_eq!(updated.attempts, 2);
        assert_eq!(updated.last_attempt_error.as_deref(), Some("timeout"));
        assert_eq!(stored_entries(store.as_ref()).await[0].attempts, 2);
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_memory() {
        let store = FailableStore::new();
        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();
        let id = queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(queue
            .enqueue(NewOperation::create("b", json!({})))
            .await
            .is_err());
        assert!(queue.dequeue(&id).await.is_err());
        assert!(queue.record_failure(&id, "x").await.is_err());

        let listed = queue.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 0);
        assert_eq!(stored_entries(&store.inner).await, listed);
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let queue = OperationQueue::load(Arc::new(MemoryKvStore::new()), make_clock(), 2)
            .await
            .unwrap();
        queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();
        queue.enqueue(NewOperation::create("b", json!({}))).await.unwrap();

        let result = queue.enqueue(NewOperation::create("c", json!({}))).await;
        assert_eq!(result, Err(QueueError::Full(2)));
    }

    #[tokio::test]
    async fn reload_restores_queue() {
        let store = Arc::new(MemoryKvStore::new());
        let clock = make_clock();
        {
            let queue = OperationQueue::load(store.clone(), clock.clone(), 100)
                .await
                .unwrap();
            queue.enqueue(NewOperation::create("a", json!({"n": 1}))).await.unwrap();
            queue.enqueue(NewOperation::create("b", json!({"n": 2}))).await.unwrap();
        }

        let reloaded = OperationQueue::load(store, clock, 100).await.unwrap();
        assert_eq!(reloaded.count().await, 2);
        assert!(reloaded.quarantined().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_entry_is_quarantined_rest_recovered() {
        let store = Arc::new(MemoryKvStore::new());
        let blob = json!([
            {"id": "op-1", "kind": "create", "resource": "a", "payload": {}, "created_at": 1, "attempts": 0},
            {"id": "op-2", "kind": "teleport", "resource": "b"},
            {"id": "op-3", "kind": "update", "resource": "c", "payload": {"x": 1}, "created_at": 2, "attempts": 4},
            "garbage",
        ]);
        store
            .set("outbox:operations", serde_json::to_vec(&blob).unwrap())
            .await
            .unwrap();

        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();

        let ids: Vec<_> = queue
            .list()
            .await
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["op-1", "op-3"]);
        assert_eq!(queue.quarantined().await.len(), 2);
        assert_eq!(stored_entries(store.as_ref()).await.len(), 2);
        assert!(store.get("outbox:quarantine").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_blob_starts_empty() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set("outbox:operations", b"{not json".to_vec())
            .await
            .unwrap();

        let queue = OperationQueue::load(store, make_clock(), 100).await.unwrap();

        assert_eq!(queue.count().await, 0);
        let quarantined = queue.quarantined().await;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].raw, json!("{not json"));
    }

    #[tokio::test]
    async fn duplicate_ids_keep_first() {
        let store = Arc::new(MemoryKvStore::new());
        let blob = json!([
            {"id": "op-1", "kind": "create", "resource": "a", "payload": {}, "created_at": 1, "attempts": 0},
            {"id": "op-1", "kind": "delete", "resource": "a", "payload": {}, "created_at": 2, "attempts": 0},
        ]);
        store
            .set("outbox:operations", serde_json::to_vec(&blob).unwrap())
            .await
            .unwrap();

        let queue = OperationQueue::load(store, make_clock(), 100).await.unwrap();
        let listed = queue.list().await;

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, crate::model::OperationKind::Create);
    }

    #[tokio::test]
    async fn unreadable_quarantine_blob_is_carried_forward() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set("outbox:quarantine", b"{truncated".to_vec())
            .await
            .unwrap();
        let blob = json!([
            {"id": "op-1", "kind": "create", "resource": "a", "payload": {}, "created_at": 1, "attempts": 0},
            {"id": "op-2", "kind": 7},
        ]);
        store
            .set("outbox:operations", serde_json::to_vec(&blob).unwrap())
            .await
            .unwrap();

        let queue = OperationQueue::load(store.clone(), make_clock(), 100)
            .await
            .unwrap();
        assert_eq!(queue.count().await, 1);

        let bytes = store.get("outbox:quarantine").await.unwrap().unwrap();
        let stored: Vec<QuarantinedRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].raw, json!("{truncated"));
        assert!(stored[0].reason.starts_with("unreadable quarantine blob"));
        assert_eq!(stored[1].raw, json!({"id": "op-2", "kind": 7}));
    }

    #[tokio::test]
    async fn duplicates_among_many_entries_are_quarantined() {
        let store = Arc::new(MemoryKvStore::new());
        let mut blob: Vec<serde_json::Value> = (0..2_000)
            .map(|i| {
                json!({
                    "id": format!("op-{i}"),
                    "kind": "update",
                    "resource": "inventory",
                    "payload": {"n": i},
                    "created_at": i,
                    "attempts": 0
                })
            })
            .collect();
        blob.push(json!({
            "id": "op-10", "kind": "delete", "resource": "inventory",
            "payload": {}, "created_at": 5_000, "attempts": 0
        }));
        store
            .set("outbox:operations", serde_json::to_vec(&blob).unwrap())
            .await
            .unwrap();

        let queue = OperationQueue::load(store, make_clock(), 10_000).await.unwrap();

        assert_eq!(queue.count().await, 2_000);
        let quarantined = queue.quarantined().await;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].reason, "duplicate operation id op-10");
    }

    #[tokio::test]
    async fn discard_removes_without_replay() {
        let queue = OperationQueue::load(Arc::new(MemoryKvStore::new()), make_clock(), 100)
            .await
            .unwrap();
        let id = queue.enqueue(NewOperation::create("a", json!({}))).await.unwrap();

        let discarded = queue.discard(&id).await.unwrap();
        assert_eq!(discarded.resource, "a");
        assert!(queue.get(&id).await.is_none());
    }
}
