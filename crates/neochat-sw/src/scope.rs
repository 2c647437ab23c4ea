//! Capabilities handed to the worker instead of ambient globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::lifecycle::WorkerId;
use crate::network::Network;
use crate::notification::NotificationSurface;

/// The host environment shared by every worker version.
#[derive(Clone)]
pub struct Host {
    pub caches: Arc<dyn CacheStorage>,
    pub network: Arc<dyn Network>,
    pub clients: Arc<dyn Clients>,
    pub notifications: Arc<dyn NotificationSurface>,
}

impl Host {
    pub fn new(
        caches: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<dyn Clients>,
        notifications: Arc<dyn NotificationSurface>,
    ) -> Self {
        Self {
            caches,
            network,
            clients,
            notifications,
        }
    }
}

/// What one worker version sees while handling events: the host plus its
/// own identity and skip-waiting flag.
#[derive(Clone)]
pub struct WorkerScope {
    host: Host,
    worker_id: WorkerId,
    skip_waiting: Arc<AtomicBool>,
}

impl WorkerScope {
    pub fn new(host: Host, worker_id: WorkerId) -> Self {
        Self {
            host,
            worker_id,
            skip_waiting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.host.caches
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.host.network
    }

    pub fn clients(&self) -> &Arc<dyn Clients> {
        &self.host.clients
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationSurface> {
        &self.host.notifications
    }

    /// Ask to be activated without waiting for controlled pages to close.
    ///
    /// Takes effect once this version is installed; has no effect on a
    /// version that is already active.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::SeqCst) {
            debug!(worker = ?self.worker_id, "skipWaiting requested");
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }
}
