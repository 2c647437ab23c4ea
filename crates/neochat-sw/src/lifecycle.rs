//! Worker versions, the registration that holds them, and the container that
//! moves them through their lifecycle:
//!
//! ```text
//! installing ──► installed (waiting) ──► activating ──► activated ──► redundant
//!      │                                                    ▲
//!      └── install failed ──────────────────────────────────┘ (redundant)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::HashMap;
use neochat_common::with_timeout;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::events::{EventOutcome, WorkerEvent};
use crate::network::{Network, NetworkError};
use crate::notification::Notification;
use crate::request::{Request, Response};
use crate::scope::{Host, WorkerScope};
use crate::version::CacheVersion;
use crate::worker::OfflineWorker;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Install event running.
    Installing,
    /// Installed; waiting if another version is active.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, failed to install, or unregistered.
    Redundant,
}

/// Public snapshot of a worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    pub cache_version: CacheVersion,
}

// ==================== Worker Version ====================

/// One installed copy of the worker with its own scope.
#[derive(Clone)]
pub struct WorkerVersion {
    pub id: WorkerId,
    pub state: WorkerState,
    pub state_changed_at: Instant,
    worker: OfflineWorker,
    scope: WorkerScope,
}

impl WorkerVersion {
    fn new(worker: OfflineWorker, scope: WorkerScope) -> Self {
        Self {
            id: scope.worker_id(),
            state: WorkerState::Installing,
            state_changed_at: Instant::now(),
            worker,
            scope,
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            state: self.state,
            cache_version: self.worker.cache_version().clone(),
        }
    }
}

impl fmt::Debug for WorkerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerVersion")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cache_version", self.worker.cache_version())
            .finish()
    }
}

// ==================== Registration ====================

/// The versions registered for one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing version.
    pub installing: Option<WorkerVersion>,

    /// Waiting version (installed but not active).
    pub waiting: Option<WorkerVersion>,

    /// Active version.
    pub active: Option<WorkerVersion>,

    /// Last time a new version was registered.
    pub last_update_check: Option<Instant>,

    /// Last known state of every version ever registered.
    history: HashMap<WorkerId, WorkerState>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
            history: HashMap::new(),
        }
    }

    /// Find a live version by ID.
    pub fn find(&self, id: WorkerId) -> Option<&WorkerVersion> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|v| v.id == id)
    }

    /// Last known state of a version, including redundant ones.
    pub fn state_of(&self, id: WorkerId) -> Option<WorkerState> {
        self.history.get(&id).copied()
    }

    fn record(&mut self, version: &WorkerVersion) {
        self.history.insert(version.id, version.state);
    }

    fn retire(&mut self, mut version: WorkerVersion) -> WorkerId {
        version.set_state(WorkerState::Redundant);
        self.record(&version);
        version.id
    }

    /// Start installing a version. Returns a displaced installing version.
    fn begin_install(&mut self, version: WorkerVersion) -> Option<WorkerId> {
        let displaced = self.installing.take().map(|old| self.retire(old));
        self.record(&version);
        self.installing = Some(version);
        self.last_update_check = Some(Instant::now());
        displaced
    }

    /// Move the installing version `id` to waiting. Returns a displaced
    /// waiting version.
    fn install_complete(&mut self, id: WorkerId) -> Result<Option<WorkerId>, ServiceWorkerError> {
        let mut version = match self.installing.take() {
            Some(v) if v.id == id => v,
            other => {
                self.installing = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {id:?} is no longer installing"
                )));
            }
        };

        version.set_state(WorkerState::Installed);
        self.record(&version);
        let displaced = self.waiting.replace(version).map(|old| self.retire(old));
        Ok(displaced)
    }

    /// Drop the installing version `id` after a failed install.
    fn install_failed(&mut self, id: WorkerId) -> bool {
        match self.installing.take() {
            Some(v) if v.id == id => {
                self.retire(v);
                true
            }
            other => {
                self.installing = other;
                false
            }
        }
    }

    /// Waiting becomes active (activating); the old active goes redundant.
    fn promote_waiting(&mut self) -> Option<(WorkerVersion, Option<WorkerId>)> {
        let mut next = self.waiting.take()?;
        let retired = self.active.take().map(|old| self.retire(old));

        next.set_state(WorkerState::Activating);
        self.record(&next);
        self.active = Some(next.clone());
        Some((next, retired))
    }

    fn activation_complete(&mut self, id: WorkerId) -> bool {
        let Some(active) = self.active.as_mut().filter(|v| v.id == id) else {
            return false;
        };
        active.set_state(WorkerState::Activated);
        let snapshot = active.clone();
        self.record(&snapshot);
        true
    }

    /// Retire every version. Returns their IDs.
    fn unregister(&mut self) -> Vec<WorkerId> {
        let versions: Vec<WorkerVersion> = [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
        ]
        .into_iter()
        .flatten()
        .collect();

        versions.into_iter().map(|v| self.retire(v)).collect()
    }
}

// ==================== Container ====================

/// Lifecycle notifications for pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { worker_id: WorkerId },
    /// A version changed state.
    StateChange {
        worker_id: WorkerId,
        new_state: WorkerState,
    },
    /// Pages are now controlled by this version.
    ControllerChange { worker_id: WorkerId },
}

/// Owns the registration and routes host events to the right version.
pub struct ServiceWorkerContainer {
    host: Host,
    registration: Arc<RwLock<Registration>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    event_timeout: Option<Duration>,
}

impl ServiceWorkerContainer {
    /// Create a new container for `scope`.
    pub fn new(scope: Url, host: Host) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                host,
                registration: Arc::new(RwLock::new(Registration::new(scope))),
                event_tx,
                event_timeout: None,
            },
            event_rx,
        )
    }

    /// Give up on any event whose work takes longer than `timeout`.
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = Some(timeout);
        self
    }

    /// Install a new version and activate it if allowed.
    ///
    /// The version activates straight away when nothing is active or when it
    /// asked to skip waiting; otherwise it stays waiting.
    pub async fn register(&self, config: WorkerConfig) -> Result<WorkerId, ServiceWorkerError> {
        config.validate()?;

        let worker = OfflineWorker::new(config);
        let scope = WorkerScope::new(self.host.clone(), WorkerId::new());
        let id = scope.worker_id();
        let version = WorkerVersion::new(worker.clone(), scope.clone());

        info!(worker = ?id, cache = %worker.cache_version(), "Installing worker");
        {
            let mut registration = self.registration.write().await;
            if let Some(displaced) = registration.begin_install(version) {
                self.emit_state(displaced, WorkerState::Redundant);
            }
        }
        self.emit(ServiceWorkerEvent::UpdateFound { worker_id: id });
        self.emit_state(id, WorkerState::Installing);

        let installed = self.run_event(&worker, &scope, WorkerEvent::Install).await;

        let activate_now = {
            let mut registration = self.registration.write().await;

            if let Err(e) = installed {
                warn!(worker = ?id, error = %e, "Install failed");
                if registration.install_failed(id) {
                    self.emit_state(id, WorkerState::Redundant);
                }
                return Err(ServiceWorkerError::InstallFailed(e.to_string()));
            }

            if let Some(displaced) = registration.install_complete(id)? {
                self.emit_state(displaced, WorkerState::Redundant);
            }
            self.emit_state(id, WorkerState::Installed);

            scope.skip_waiting_requested() || registration.active.is_none()
        };

        if activate_now {
            self.activate_waiting().await?;
        } else {
            info!(worker = ?id, "Installed, waiting for activation");
        }

        Ok(id)
    }

    /// Promote the waiting version, if any, and run its activate event.
    async fn activate_waiting(&self) -> Result<(), ServiceWorkerError> {
        let promoted = self.registration.write().await.promote_waiting();
        let Some((next, retired)) = promoted else {
            return Ok(());
        };

        if let Some(old) = retired {
            self.emit_state(old, WorkerState::Redundant);
        }
        self.emit_state(next.id, WorkerState::Activating);

        // A failed activate event does not stop activation
        if let Err(e) = self.run_event(&next.worker, &next.scope, WorkerEvent::Activate).await {
            warn!(worker = ?next.id, error = %e, "Activate handler failed");
        }

        if self.registration.write().await.activation_complete(next.id) {
            info!(worker = ?next.id, cache = %next.worker.cache_version(), "Worker activated");
            self.emit_state(next.id, WorkerState::Activated);
            self.emit(ServiceWorkerEvent::ControllerChange { worker_id: next.id });
        }
        Ok(())
    }

    /// Deliver a page message to version `target`.
    ///
    /// If the message makes a waiting version skip waiting, it is activated
    /// before this returns.
    pub async fn post_message(
        &self,
        target: WorkerId,
        data: JsonValue,
    ) -> Result<(), ServiceWorkerError> {
        let (worker, scope) = {
            let registration = self.registration.read().await;
            match registration.find(target) {
                Some(v) => (v.worker.clone(), v.scope.clone()),
                None if registration.state_of(target) == Some(WorkerState::Redundant) => {
                    return Err(ServiceWorkerError::StateError(
                        "Cannot post message to redundant worker".to_string(),
                    ));
                }
                None => return Err(ServiceWorkerError::NotFound(format!("worker {target:?}"))),
            }
        };

        self.run_event(&worker, &scope, WorkerEvent::Message(data)).await?;

        if scope.skip_waiting_requested() {
            let is_waiting = self
                .registration
                .read()
                .await
                .waiting
                .as_ref()
                .is_some_and(|v| v.id == target);
            if is_waiting {
                debug!(worker = ?target, "Skipping wait on request");
                self.activate_waiting().await?;
            }
        }
        Ok(())
    }

    /// A page request. Goes through the active version when there is one;
    /// requests it does not intercept go straight to the network.
    ///
    /// An intercepted request always gets a response: if the handler fails
    /// or times out, the cached copy or the offline fallback is returned.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
        if let Some(active) = self.active_version().await {
            match self
                .run_event(&active.worker, &active.scope, WorkerEvent::Fetch(request.clone()))
                .await
            {
                Ok(EventOutcome::Respond(response)) => return Ok(response),
                Ok(_) => {}
                Err(e) if request.is_get() => {
                    warn!(url = %request.url, error = %e, "Fetch handler failed, serving offline");
                    let caches = active.scope.caches().as_ref();
                    return Ok(active.worker.offline_response(caches, &request).await);
                }
                Err(e) => warn!(url = %request.url, error = %e, "Fetch handler failed"),
            }
        }

        self.host.network.fetch(&request).await
    }

    /// Deliver a push message to the active version.
    pub async fn push(&self, data: Option<Bytes>) -> Result<(), ServiceWorkerError> {
        let active = self.require_active().await?;
        self.run_event(&active.worker, &active.scope, WorkerEvent::Push(data))
            .await
            .map(|_| ())
    }

    /// Deliver a notification click to the active version.
    pub async fn notification_click(
        &self,
        notification: Notification,
    ) -> Result<(), ServiceWorkerError> {
        let active = self.require_active().await?;
        self.run_event(
            &active.worker,
            &active.scope,
            WorkerEvent::NotificationClick(notification),
        )
        .await
        .map(|_| ())
    }

    /// Retire every version.
    pub async fn unregister(&self) -> bool {
        let retired = self.registration.write().await.unregister();
        for id in &retired {
            self.emit_state(*id, WorkerState::Redundant);
        }
        !retired.is_empty()
    }

    pub async fn installing(&self) -> Option<WorkerInfo> {
        self.registration.read().await.installing.as_ref().map(WorkerVersion::info)
    }

    pub async fn waiting(&self) -> Option<WorkerInfo> {
        self.registration.read().await.waiting.as_ref().map(WorkerVersion::info)
    }

    pub async fn active(&self) -> Option<WorkerInfo> {
        self.registration.read().await.active.as_ref().map(WorkerVersion::info)
    }

    /// Last known state of any version registered through this container.
    pub async fn state_of(&self, id: WorkerId) -> Option<WorkerState> {
        self.registration.read().await.state_of(id)
    }

    async fn active_version(&self) -> Option<WorkerVersion> {
        self.registration.read().await.active.clone()
    }

    async fn require_active(&self) -> Result<WorkerVersion, ServiceWorkerError> {
        self.active_version()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))
    }

    async fn run_event(
        &self,
        worker: &OfflineWorker,
        scope: &WorkerScope,
        event: WorkerEvent,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        match self.event_timeout {
            Some(timeout) => with_timeout(timeout, || worker.dispatch(scope, event))
                .await
                .map_err(|_| ServiceWorkerError::Timeout(timeout))?,
            None => worker.dispatch(scope, event).await,
        }
    }

    fn emit_state(&self, worker_id: WorkerId, new_state: WorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}
