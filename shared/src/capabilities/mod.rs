//! Ports to the host: persistent key-value storage and HTTP reachability.

pub mod http;
pub mod kv;

pub use self::http::{HttpError, HttpReachabilityCheck, HttpTransport, ValidatedUrl};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode, TypedKvStore,
};

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Storage error: {0}")]
    Kv(#[from] KvError),
}
