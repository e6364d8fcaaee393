use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, TypedKvStore};
use crate::clock::{Clock, UnixTimeMs};
use crate::config::OfflineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry<T> {
    stored_at: UnixTimeMs,
    data: T,
}

/// Expiring local snapshots so screens can render while offline.
///
/// Entries live under `offline_data:<key>`. An expired or undecodable entry
/// is removed on read and reported as absent.
pub struct OfflineDataCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl OfflineDataCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self { store, clock, ttl_ms }
    }

    /// Cache whose entries expire after `offline_data_ttl_ms`.
    pub fn from_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &OfflineConfig,
    ) -> Self {
        Self::new(store, clock, config.offline_data_ttl_ms)
    }

    #[instrument(skip(self, value))]
    pub async fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KvError> {
        let key = KvKey::new(KeyNamespace::OfflineData, key)?.raw();
        let entry = CachedEntry {
            stored_at: self.clock.now(),
            data: value,
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.clone()),
        })?;
        self.store.set(&key, bytes).await
    }

    #[instrument(skip(self))]
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, KvError>
    where
        T: Serialize + DeserializeOwned,
    {
        let typed = TypedKvStore::<CachedEntry<T>>::new(KeyNamespace::OfflineData);

        let entry = match typed.get(self.store.as_ref(), key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(KvError::Serialization { message, .. }) => {
                warn!("dropping undecodable offline data: {}", message);
                typed.remove(self.store.as_ref(), key).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.clock.now().millis_since(entry.stored_at) > self.ttl_ms {
            debug!(stored_at = %entry.stored_at, "offline data expired");
            typed.remove(self.store.as_ref(), key).await?;
            return Ok(None);
        }

        Ok(Some(entry.data))
    }

    /// Presence check that ignores the payload type.
    pub async fn contains(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get::<serde_json::Value>(key).await?.is_some())
    }

    pub async fn remove(&self, key: &str) -> Result<bool, KvError> {
        TypedKvStore::<CachedEntry<serde_json::Value>>::new(KeyNamespace::OfflineData)
            .remove(self.store.as_ref(), key)
            .await
    }
}
