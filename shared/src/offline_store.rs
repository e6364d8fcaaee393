use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument};

use crate::capabilities::kv::{KeyValueStore, KvError, StorageErrorCode, MAX_VALUE_SIZE};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"OFKV";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for KvError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Io(io) => StorageErrorCode::from_io(io),
            StoreError::Serialization(_) => StorageErrorCode::Unknown,
            _ => StorageErrorCode::Corrupted,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

type Entries = BTreeMap<String, ByteBuf>;

/// File-backed `KeyValueStore`.
///
/// The whole map lives in one CBOR file inside a checksummed envelope. Every
/// write replaces the file atomically (temp file, fsync, rename), so a crash
/// leaves either the old or the new map on disk, never a torn one.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl FileKvStore {
    /// A missing file opens empty. A damaged one fails with a typed error
    /// rather than silently discarding data.
    #[instrument(skip_all)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                return Err(StoreError::Corrupted {
                    reason: "empty file",
                });
            }
            decode(&bytes)?
        } else {
            Entries::new()
        };

        info!(path = %path.display(), keys = entries.len(), "opened file store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, entries: &Entries) -> Result<(), KvError> {
        let bytes = encode(entries)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || save_atomic(&path, &bytes))
            .await
            .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
            .map_err(|e| {
                error!("failed to write store file: {}", e);
                KvError::from(e)
            })
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .map(|v| v.clone().into_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let mut entries = self.entries.write().await;
        let previous = entries.insert(key.to_string(), ByteBuf::from(value));

        if let Err(e) = self.write(&entries).await {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };

        if let Err(e) = self.write(&entries).await {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }
}

fn encode(entries: &Entries) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(entries, &mut payload)?;

    let checksum = blake3::hash(&payload);
    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Entries, StoreError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

fn save_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}
