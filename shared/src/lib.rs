//! Connectivity detection and offline operation replay for a client backed by
//! a remote data API.
//!
//! [`ConnectivityProbe`] decides whether the internet and the backend are
//! reachable, [`OperationQueue`] keeps writes made while disconnected,
//! [`SyncEngine`] replays them, and [`OfflineCoordinator`] ties the three
//! together behind the surface the UI talks to.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod event;
pub mod model;
pub mod offline_data;
pub mod offline_store;
pub mod queue;
pub mod race;
pub mod sync;

pub use capabilities::{
    CapabilityError, HttpError, HttpReachabilityCheck, HttpTransport, KeyValueStore, KvError,
    MemoryKvStore,
};
pub use clock::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use config::{ConfigError, OfflineConfig};
pub use connectivity::{
    BackendClient, BackendError, ConnectivityPhase, ConnectivityProbe, ConnectivityState,
    ProbeError, ReachabilityCheck,
};
pub use coordinator::{CoordinatorError, OfflineCoordinator};
pub use event::{
    ConnectivityEvent, ListenerRegistry, LogNotifier, Notifier, Subscription, Transition,
    UserNotification,
};
pub use model::{NewOperation, OpId, OperationKind, QueuedOperation, SyncFailure, SyncResult};
pub use offline_data::OfflineDataCache;
pub use offline_store::{FileKvStore, StoreError};
pub use queue::{OperationQueue, QuarantinedRecord, QueueError};
pub use race::{first_to_complete, RaceOutcome};
pub use sync::{ErrorCategory, OperationHandler, ReplayError, SyncEngine, SyncError};
