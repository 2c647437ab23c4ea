//! # NeoChat Offline Worker
//!
//! The offline/caching layer of the NeoChat web client, modelled on a
//! browser service worker.
//!
//! ## Features
//!
//! - **Lifecycle**: install seeds the current cache bucket, activate prunes
//!   every other bucket and claims open pages
//! - **Fetch interception**: network-first for GET requests, falling back to
//!   the cache and then to a synthesized 503
//! - **Push notifications**: display, coalesce by tag, focus-or-open on click
//! - **Control channel**: `SKIP_WAITING` promotes a waiting version
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── Registration
//!     │       ├── installing (WorkerVersion)
//!     │       ├── waiting    (WorkerVersion)
//!     │       └── active     (WorkerVersion)
//!     │
//!     └── Host (injected capabilities)
//!             ├── CacheStorage ── Cache ── RequestKey → CacheEntry
//!             ├── Network
//!             ├── Clients
//!             └── NotificationSurface
//!
//! WorkerVersion = OfflineWorker (handlers) + WorkerScope (host, id, skip flag)
//! ```
//!
//! Every handler registers its asynchronous work on an [`ExtendableEvent`];
//! the container does not consider an event handled until that work settles.

use std::time::Duration;

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod notification;
pub mod request;
pub mod scope;
pub mod version;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCache, MemoryCacheStorage};
pub use clients::{Client, ClientId, ClientRegistry, ClientType, Clients};
pub use config::{NotificationConfig, SeedRetryPolicy, WorkerConfig};
pub use events::{ControlMessage, EventOutcome, ExtendableEvent, WorkerEvent};
pub use lifecycle::{
    Registration, ServiceWorkerContainer, ServiceWorkerEvent, WorkerId, WorkerInfo, WorkerState,
};
pub use network::{HttpNetwork, LoaderConfig, Network, NetworkError};
pub use notification::{
    Notification, NotificationCenter, NotificationDescriptor, NotificationId, NotificationSurface,
};
pub use request::{Request, RequestKey, Response, ResponseSource, OFFLINE_BODY};
pub use scope::{Host, WorkerScope};
pub use version::CacheVersion;
pub use worker::OfflineWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid cache name: {0}")]
    InvalidCacheName(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Event timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl From<NetworkError> for ServiceWorkerError {
    fn from(err: NetworkError) -> Self {
        ServiceWorkerError::NetworkError(err.to_string())
    }
}
